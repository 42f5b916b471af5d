//! Flood control: token buckets for connections and commands.
//!
//! Two independent limiter families, both built on `governor`'s lock-free
//! token buckets:
//!
//! - per-source-IP **connection** buckets: a fresh TCP accept consumes one
//!   token; on starvation the connection is refused at the gateway.
//! - per-connection **command** buckets: every parsed command consumes one
//!   token; a starved command is dropped, and sustained starvation inside
//!   a short window escalates to a flood disconnect.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use nonzero_ext::nonzero;
use std::net::IpAddr;
use std::num::NonZeroU32;

/// Outcome of admitting one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDecision {
    Allow,
    /// Token bucket empty: drop the command, keep the connection.
    Drop,
    /// Starvation crossed the flood threshold: disconnect with
    /// `ERROR :Excess Flood`.
    Flood,
}

pub struct RateLimiter {
    connection_buckets: DashMap<IpAddr, DefaultDirectRateLimiter>,
    command_buckets: DashMap<String, DefaultDirectRateLimiter>,
    /// Consecutive starved commands per connection.
    violations: DashMap<String, u32>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            connection_buckets: DashMap::new(),
            command_buckets: DashMap::new(),
            violations: DashMap::new(),
            config,
        }
    }

    fn quota(per_second: u32, burst: u32) -> Quota {
        let rate = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
        Quota::per_second(rate).allow_burst(burst)
    }

    /// Admit or refuse a new connection from this address.
    pub fn admit_connection(&self, ip: IpAddr) -> bool {
        let bucket = self.connection_buckets.entry(ip).or_insert_with(|| {
            Governor::direct(Self::quota(
                self.config.connections_per_second,
                self.config.connection_burst,
            ))
        });
        let allowed = bucket.check().is_ok();
        if !allowed {
            crate::metrics::RATE_LIMIT_HITS
                .with_label_values(&["connection"])
                .inc();
            tracing::debug!(ip = %ip, "connection rate limit exceeded");
        }
        allowed
    }

    /// Admit one command on a connection.
    pub fn admit_command(&self, conn_id: &str) -> CommandDecision {
        let bucket = self
            .command_buckets
            .entry(conn_id.to_string())
            .or_insert_with(|| {
                Governor::direct(Self::quota(
                    self.config.commands_per_second,
                    self.config.command_burst,
                ))
            });

        if bucket.check().is_ok() {
            self.violations.remove(conn_id);
            return CommandDecision::Allow;
        }

        crate::metrics::RATE_LIMIT_HITS
            .with_label_values(&["command"])
            .inc();
        let mut entry = self.violations.entry(conn_id.to_string()).or_insert(0);
        *entry += 1;
        if *entry >= self.config.flood_threshold {
            tracing::warn!(conn = %conn_id, violations = *entry, "Flood threshold reached");
            CommandDecision::Flood
        } else {
            CommandDecision::Drop
        }
    }

    /// Forget a connection's buckets on disconnect.
    pub fn forget_connection(&self, conn_id: &str) {
        self.command_buckets.remove(conn_id);
        self.violations.remove(conn_id);
    }

    /// Bound memory growth of the per-IP map; called from the maintenance
    /// task.
    pub fn prune(&self) {
        const MAX_ENTRIES: usize = 10_000;
        if self.connection_buckets.len() > MAX_ENTRIES {
            self.connection_buckets.clear();
            tracing::debug!("connection rate limiter map cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, flood: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            connections_per_second: 1,
            connection_burst: 3,
            commands_per_second: 1,
            command_burst: burst,
            flood_threshold: flood,
        })
    }

    #[test]
    fn command_burst_then_drop() {
        let rl = limiter(10, 100);
        let conn = "0LTAAAAAA";
        let mut allowed = 0;
        for _ in 0..20 {
            if rl.admit_command(conn) == CommandDecision::Allow {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10, "exactly the burst is admitted");
    }

    #[test]
    fn sustained_starvation_floods() {
        let rl = limiter(2, 5);
        let conn = "0LTAAAAAB";
        let mut last = CommandDecision::Allow;
        for _ in 0..20 {
            last = rl.admit_command(conn);
            if last == CommandDecision::Flood {
                break;
            }
        }
        assert_eq!(last, CommandDecision::Flood);
    }

    #[test]
    fn connection_bucket_per_ip() {
        let rl = limiter(2, 5);
        let a: IpAddr = "198.51.100.1".parse().unwrap();
        let b: IpAddr = "198.51.100.2".parse().unwrap();
        assert!(rl.admit_connection(a));
        assert!(rl.admit_connection(a));
        assert!(rl.admit_connection(a));
        assert!(!rl.admit_connection(a), "burst of 3 exhausted");
        assert!(rl.admit_connection(b), "other IPs unaffected");
    }

    #[test]
    fn forget_resets_violations() {
        let rl = limiter(1, 3);
        let conn = "0LTAAAAAC";
        for _ in 0..3 {
            rl.admit_command(conn);
        }
        rl.forget_connection(conn);
        // Fresh bucket: first command allowed again.
        assert_eq!(rl.admit_command(conn), CommandDecision::Allow);
    }
}
