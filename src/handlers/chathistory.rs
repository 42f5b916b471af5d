//! CHATHISTORY (IRCv3): playback of stored messages in a batch.
//!
//! Supported subcommands: `LATEST <target> * <limit>`, `BEFORE <target>
//! timestamp=<ts> <limit>`, `AFTER <target> timestamp=<ts> <limit>`,
//! `BETWEEN <target> timestamp=<a> timestamp=<b> <limit>`. Replayed lines
//! carry their original `msgid` and a `server-time` tag, wrapped in a
//! `chathistory` batch when the client negotiated `batch`.

use super::context::Context;
use super::Handler;
use crate::broker::batch_ref;
use crate::db::StoredMessage;
use crate::error::{HandlerError, HandlerResult};
use async_trait::async_trait;
use lattice_proto::message::Source;
use lattice_proto::{irc_to_lower, Message};

/// Ceiling on messages returned per request.
const MAX_REPLAY: u32 = 100;

pub struct ChatHistoryHandler;

#[async_trait]
impl Handler for ChatHistoryHandler {
    fn min_params(&self) -> usize {
        3
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let sub = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_ascii_uppercase();
        let target = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let folded = irc_to_lower(&target);

        let (since, before, limit_idx) = match sub.as_str() {
            "LATEST" => (None, None, 3),
            "BEFORE" => (None, parse_timestamp(msg.arg(2)), 3),
            "AFTER" => (parse_timestamp(msg.arg(2)), None, 3),
            "BETWEEN" => (
                parse_timestamp(msg.arg(2)),
                parse_timestamp(msg.arg(3)),
                4,
            ),
            _ => {
                ctx.reply(fail_message(
                    &ctx.fabric.server.name,
                    "CHATHISTORY",
                    "INVALID_PARAMS",
                    "Unknown subcommand",
                ));
                return Ok(());
            }
        };

        let limit = msg
            .arg(limit_idx)
            .and_then(|l| l.parse::<u32>().ok())
            .unwrap_or(50)
            .min(MAX_REPLAY);

        let messages = match ctx
            .fabric
            .db
            .query_messages(&folded, since, before, limit)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, target = %folded, "History query failed");
                ctx.reply(fail_message(
                    &ctx.fabric.server.name,
                    "CHATHISTORY",
                    "MESSAGE_ERROR",
                    "Messages could not be retrieved",
                ));
                return Ok(());
            }
        };

        replay(ctx, &target, messages);
        Ok(())
    }
}

/// `timestamp=2024-01-01T00:00:00.000Z` → unix millis.
fn parse_timestamp(arg: Option<&str>) -> Option<i64> {
    let raw = arg?.strip_prefix("timestamp=")?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.timestamp_millis())
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_default()
}

fn replay(ctx: &mut Context<'_>, target: &str, messages: Vec<StoredMessage>) {
    let use_batch = ctx.session.has_cap("batch");
    let server = ctx.fabric.server.name.clone();
    let token = batch_ref();

    if use_batch {
        ctx.reply(
            Message::cmd(
                "BATCH",
                [format!("+{}", token), "chathistory".to_string(), target.to_string()],
            )
            .from_server(&server),
        );
    }
    for stored in messages {
        let mut line = Message::privmsg(target, &stored.text)
            .with_source(Source::parse(&stored.prefix))
            .with_tag("time", Some(&format_timestamp(stored.sent_at)))
            .with_tag("msgid", Some(&stored.msgid));
        if use_batch {
            line = line.with_tag("batch", Some(&token));
        }
        ctx.reply(line);
    }
    if use_batch {
        ctx.reply(Message::cmd("BATCH", [format!("-{}", token)]).from_server(&server));
    }
}

fn fail_message(server: &str, command: &str, code: &str, text: &str) -> Message {
    Message::cmd("FAIL", [command, code, text]).from_server(server)
}
