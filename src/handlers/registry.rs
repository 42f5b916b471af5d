//! Command registry and dispatch.
//!
//! Dispatch order per command: handler lookup (421 for unknown), rate
//! limiting, registration gate (451), operator gate (481), minimum
//! parameter count (461), then the handler itself. Structured errors
//! returned by handlers are translated to numerics here; per-command
//! usage counters feed STATS m.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::security::CommandDecision;
use lattice_proto::{Message, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub struct Registry {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
    command_counts: HashMap<&'static str, AtomicU64>,
}

impl Registry {
    /// Build the registry with every built-in handler.
    pub fn new() -> Self {
        use super::{cap, channel, chathistory, connection, messaging, mode, oper, server_query, user_query};

        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();

        // Connection / registration
        handlers.insert("NICK", Box::new(connection::NickHandler));
        handlers.insert("USER", Box::new(connection::UserHandler));
        handlers.insert("PASS", Box::new(connection::PassHandler));
        handlers.insert("PING", Box::new(connection::PingHandler));
        handlers.insert("PONG", Box::new(connection::PongHandler));
        handlers.insert("QUIT", Box::new(connection::QuitHandler));
        handlers.insert("CAP", Box::new(cap::CapHandler));
        handlers.insert("AUTHENTICATE", Box::new(cap::AuthenticateHandler));

        // Channels
        handlers.insert("JOIN", Box::new(channel::JoinHandler));
        handlers.insert("PART", Box::new(channel::PartHandler));
        handlers.insert("KICK", Box::new(channel::KickHandler));
        handlers.insert("INVITE", Box::new(channel::InviteHandler));
        handlers.insert("TOPIC", Box::new(channel::TopicHandler));
        handlers.insert("NAMES", Box::new(channel::NamesHandler));
        handlers.insert("LIST", Box::new(channel::ListHandler));
        handlers.insert("MODE", Box::new(mode::ModeHandler));

        // Messaging
        handlers.insert("PRIVMSG", Box::new(messaging::PrivmsgHandler));
        handlers.insert("NOTICE", Box::new(messaging::NoticeHandler));

        // User queries and status
        handlers.insert("WHO", Box::new(user_query::WhoHandler));
        handlers.insert("WHOIS", Box::new(user_query::WhoisHandler));
        handlers.insert("WHOWAS", Box::new(user_query::WhowasHandler));
        handlers.insert("USERHOST", Box::new(user_query::UserhostHandler));
        handlers.insert("ISON", Box::new(user_query::IsonHandler));
        handlers.insert("AWAY", Box::new(user_query::AwayHandler));

        // Server queries
        handlers.insert("MOTD", Box::new(server_query::MotdHandler));
        handlers.insert("LUSERS", Box::new(server_query::LusersHandler));
        handlers.insert("VERSION", Box::new(server_query::VersionHandler));
        handlers.insert("TIME", Box::new(server_query::TimeHandler));
        handlers.insert("ADMIN", Box::new(server_query::AdminHandler));
        handlers.insert("INFO", Box::new(server_query::InfoHandler));
        handlers.insert("STATS", Box::new(server_query::StatsHandler));

        // Operator commands
        handlers.insert("OPER", Box::new(oper::OperHandler));
        handlers.insert("KILL", Box::new(oper::KillHandler));
        handlers.insert("WALLOPS", Box::new(oper::WallopsHandler));
        handlers.insert("KLINE", Box::new(oper::KlineHandler));
        handlers.insert("UNKLINE", Box::new(oper::UnklineHandler));
        handlers.insert("REHASH", Box::new(oper::RehashHandler));
        handlers.insert("DIE", Box::new(oper::DieHandler));
        handlers.insert("RESTART", Box::new(oper::RestartHandler));

        // IRCv3 chathistory
        handlers.insert("CHATHISTORY", Box::new(chathistory::ChatHistoryHandler));

        let command_counts = handlers
            .keys()
            .map(|&cmd| (cmd, AtomicU64::new(0)))
            .collect();

        Self {
            handlers,
            command_counts,
        }
    }

    /// Usage counters for STATS m, most-used first.
    pub fn command_stats(&self) -> Vec<(&'static str, u64)> {
        let mut stats: Vec<_> = self
            .command_counts
            .iter()
            .map(|(cmd, count)| (*cmd, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        stats.sort_by(|a, b| b.1.cmp(&a.1));
        stats
    }

    /// Dispatch one client message.
    pub async fn dispatch(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let command = msg.command.clone();

        let Some(handler) = self.handlers.get(command.as_str()) else {
            ctx.numeric(
                Response::ERR_UNKNOWNCOMMAND,
                [command.as_str(), "Unknown command"],
            );
            return Ok(());
        };

        match ctx.fabric.rate_limiter.admit_command(ctx.uid) {
            CommandDecision::Allow => {}
            CommandDecision::Drop => {
                debug!(uid = %ctx.uid, command = %command, "Command dropped by rate limit");
                return Err(HandlerError::RateLimited);
            }
            CommandDecision::Flood => {
                ctx.reply(Message::irc_error("Excess Flood"));
                return Err(HandlerError::AccessDenied);
            }
        }

        if handler.needs_registration() && !ctx.session.registered {
            ctx.numeric(Response::ERR_NOTREGISTERED, ["You have not registered"]);
            return Ok(());
        }
        if handler.needs_oper() && !ctx.is_oper().await {
            ctx.numeric(
                Response::ERR_NOPRIVILEGES,
                ["Permission Denied- You're not an IRC operator"],
            );
            return Ok(());
        }
        if msg.params.len() < handler.min_params() {
            ctx.numeric(
                Response::ERR_NEEDMOREPARAMS,
                [command.as_str(), "Not enough parameters"],
            );
            return Ok(());
        }

        if let Some(counter) = self.command_counts.get(command.as_str()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let span = tracing::debug_span!(
            "irc.command",
            command = %command,
            uid = %ctx.uid,
            nick = %ctx.nick(),
        );
        let result = {
            use tracing::Instrument;
            handler.handle(ctx, msg).instrument(span).await
        };

        // Translate structured handler errors into numerics; the rest
        // bubbles up to the connection loop.
        match result {
            Err(HandlerError::NeedMoreParams) => {
                ctx.numeric(
                    Response::ERR_NEEDMOREPARAMS,
                    [command.as_str(), "Not enough parameters"],
                );
                Ok(())
            }
            Err(HandlerError::NoTextToSend) => {
                ctx.numeric(Response::ERR_NOTEXTTOSEND, ["No text to send"]);
                Ok(())
            }
            Err(HandlerError::NotRegistered) => {
                ctx.numeric(Response::ERR_NOTREGISTERED, ["You have not registered"]);
                Ok(())
            }
            Err(HandlerError::NoPrivileges) => {
                ctx.numeric(
                    Response::ERR_NOPRIVILEGES,
                    ["Permission Denied- You're not an IRC operator"],
                );
                Ok(())
            }
            Err(HandlerError::Internal(detail)) => {
                tracing::error!(command = %command, detail = %detail, "Handler error");
                Ok(())
            }
            other => other,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
