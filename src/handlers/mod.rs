//! Command handlers and the dispatcher.

pub mod cap;
pub mod channel;
pub mod chathistory;
pub mod connection;
pub mod context;
pub mod messaging;
pub mod mode;
pub mod oper;
pub mod registry;
pub mod server_query;
pub mod user_query;

pub use context::Context;
pub use registry::Registry;

use crate::error::HandlerResult;
use async_trait::async_trait;
use lattice_proto::Message;

/// One command handler. The declarative gates are enforced by the
/// dispatcher before `handle` runs: parameter count (461), registration
/// (451), and operator status (481).
#[async_trait]
pub trait Handler: Send + Sync {
    fn min_params(&self) -> usize {
        0
    }

    fn needs_registration(&self) -> bool {
        true
    }

    fn needs_oper(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult;
}
