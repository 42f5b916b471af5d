//! Security subsystems: hostmask cloaking, flood control, server bans.

pub mod bans;
pub mod cloak;
pub mod rate_limit;

pub use bans::{BanKind, BanTable, ServerBan};
pub use cloak::Cloaker;
pub use rate_limit::{CommandDecision, RateLimiter};
