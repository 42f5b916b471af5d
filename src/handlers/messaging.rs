//! PRIVMSG and NOTICE: the message fan-out path.
//!
//! Channel delivery enforces the speaking policy in order: membership for
//! +n, voice for +m, ban status, +R, then the content filters (+C blocks
//! CTCP except ACTION, +c/+S strip formatting). NOTICE follows the same
//! path but never generates replies, per the RFC.

use super::channel::run_triggers;
use super::context::Context;
use super::Handler;
use crate::db::StoredMessage;
use crate::error::{HandlerError, HandlerResult};
use crate::state::Fabric;
use crate::triggers::TriggerEvent;
use async_trait::async_trait;
use lattice_proto::ident::{ChannelName, ServerId};
use lattice_proto::message::Source;
use lattice_proto::{irc_to_lower, MemberRank, Message, Response};
use std::sync::Arc;

pub struct PrivmsgHandler;

#[async_trait]
impl Handler for PrivmsgHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        relay_message(ctx, msg, false).await
    }
}

pub struct NoticeHandler;

#[async_trait]
impl Handler for NoticeHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        relay_message(ctx, msg, true).await
    }
}

/// Why a channel refused a message.
enum SendDenied {
    NotExternal,
    Moderated,
    Banned,
    NeedRegged,
    BlockedCtcp,
}

impl SendDenied {
    fn text(&self) -> &'static str {
        match self {
            SendDenied::NotExternal => "Cannot send to channel (+n)",
            SendDenied::Moderated => "Cannot send to channel (+m)",
            SendDenied::Banned => "Cannot send to channel (+b)",
            SendDenied::NeedRegged => "Cannot send to channel (+R)",
            SendDenied::BlockedCtcp => "Cannot send CTCP to channel (+C)",
        }
    }
}

async fn relay_message(ctx: &mut Context<'_>, msg: &Message, is_notice: bool) -> HandlerResult {
    let command = if is_notice { "NOTICE" } else { "PRIVMSG" };

    let Some(targets) = msg.arg(0).filter(|t| !t.is_empty()) else {
        if !is_notice {
            ctx.numeric(
                Response::ERR_NORECIPIENT,
                [format!("No recipient given ({})", command)],
            );
        }
        return Ok(());
    };
    let Some(text) = msg.arg(1).filter(|t| !t.is_empty()) else {
        if !is_notice {
            ctx.numeric(Response::ERR_NOTEXTTOSEND, ["No text to send"]);
        }
        return Ok(());
    };
    let targets = targets.to_string();
    let text = text.to_string();

    let max_targets = ctx.fabric.config().limits.max_targets;
    let list: Vec<&str> = targets.split(',').filter(|t| !t.is_empty()).collect();
    if list.len() > max_targets {
        if !is_notice {
            ctx.numeric(
                Response::ERR_TOOMANYTARGETS,
                [
                    targets.as_str(),
                    "Too many targets",
                ],
            );
        }
        return Ok(());
    }

    // Client-only tags (`+`-prefixed) ride along under message-tags.
    let client_tags: Vec<lattice_proto::Tag> = msg
        .tags
        .iter()
        .filter(|t| t.key.starts_with('+'))
        .cloned()
        .collect();

    for target in list {
        send_one(ctx, target, &text, is_notice, &client_tags).await?;
    }
    Ok(())
}

async fn send_one(
    ctx: &mut Context<'_>,
    target: &str,
    text: &str,
    is_notice: bool,
    client_tags: &[lattice_proto::Tag],
) -> HandlerResult {
    let command = if is_notice { "NOTICE" } else { "PRIVMSG" };
    let (nick, username, host) = ctx
        .source_parts()
        .await
        .ok_or(HandlerError::NotRegistered)?;
    let account = {
        let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;
        let account = user_arc.read().await.account.clone();
        account
    };
    let source = Source::User {
        nick: nick.clone(),
        user: username.clone(),
        host: host.clone(),
    };

    if ChannelName::is_channel_like(target) {
        let folded = irc_to_lower(target);
        let display;
        let text = match check_channel_policy(ctx.fabric, &folded, ctx.uid, text).await {
            Ok((name, filtered)) => {
                display = name;
                filtered
            }
            Err(Some(denied)) => {
                if !is_notice {
                    ctx.numeric(Response::ERR_CANNOTSENDTOCHAN, [target, denied.text()]);
                }
                return Ok(());
            }
            Err(None) => {
                if !is_notice {
                    ctx.numeric(Response::ERR_NOSUCHCHANNEL, [target, "No such channel"]);
                }
                return Ok(());
            }
        };

        let msgid = new_msgid();
        let mut out = Message::cmd(command, [display.as_str(), text.as_str()])
            .with_source(source)
            .with_tag("msgid", Some(&msgid));
        for tag in client_tags {
            out.tags.push(tag.clone());
        }
        if let Some(account) = &account {
            out = out.with_tag("account", Some(account));
        }

        // echo-message: the sender gets a copy only with the capability.
        let echo = ctx.session.has_cap("echo-message");
        let except = if echo { None } else { Some(ctx.uid) };
        ctx.fabric
            .send_to_channel(&folded, out, except)
            .await;
        ctx.fabric
            .relay_to_channel_peers(
                &folded,
                Message::cmd(command, [display.as_str(), text.as_str()])
                    .with_source(Source::Name(ctx.uid.to_string())),
                None,
            )
            .await;

        if !is_notice {
            let stored = StoredMessage {
                msgid,
                target: folded.clone(),
                sender_nick: nick.clone(),
                prefix: format!("{}!{}@{}", nick, username, host),
                text: text.clone(),
                account,
                sent_at: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = ctx.fabric.db.store_message(&stored).await {
                tracing::debug!(error = %e, "Failed to store message history");
            }
            run_triggers(ctx, TriggerEvent::Message, Some(&display), &text).await;
        }
    } else if let Some(target_uid) = ctx.fabric.uid_by_nick(target) {
        let mut out = Message::cmd(command, [target, text]).with_source(source);
        for tag in client_tags {
            out.tags.push(tag.clone());
        }
        if ctx.fabric.is_local(&target_uid) {
            // Away reply for direct messages.
            if !is_notice {
                if let Some(user_arc) = ctx.fabric.user_by_uid(&target_uid) {
                    let away = user_arc.read().await.away.clone();
                    if let Some(away) = away {
                        ctx.numeric(Response::RPL_AWAY, [target, away.as_str()]);
                    }
                }
            }
            ctx.fabric.send_to_uid(&target_uid, out);
            if ctx.session.has_cap("echo-message") {
                ctx.reply(Message::cmd(command, [target, text]).with_source(Source::User {
                    nick,
                    user: username,
                    host,
                }));
            }
        } else if let Ok(sid) = ServerId::parse(&target_uid[..3]) {
            let routed = Message::cmd(command, [target_uid.as_str(), text])
                .with_source(Source::Name(ctx.uid.to_string()));
            ctx.fabric.sync.route(&sid, Arc::new(routed)).await;
        }
    } else if !is_notice {
        ctx.numeric(Response::ERR_NOSUCHNICK, [target, "No such nick/channel"]);
    }
    Ok(())
}

/// Check the channel speaking policy and apply content filters. Returns
/// the display name and the (possibly rewritten) text, or the denial.
async fn check_channel_policy(
    fabric: &Arc<Fabric>,
    folded: &str,
    sender_uid: &str,
    text: &str,
) -> Result<(String, String), Option<SendDenied>> {
    let Some(chan_arc) = fabric.channel(folded) else {
        return Err(None);
    };
    let user_arc = fabric.user_by_uid(sender_uid).ok_or(None)?;
    let (masks, account, is_oper) = {
        let user = user_arc.read().await;
        (user.ban_masks(), user.account.clone(), user.is_oper())
    };

    let chan = chan_arc.read().await;
    let member = chan.member_modes(sender_uid);

    if is_oper {
        return Ok((chan.name.clone(), filter_text(&chan, text)?));
    }
    if chan.modes.has('n') && member.is_none() {
        return Err(Some(SendDenied::NotExternal));
    }
    if chan.modes.has('m')
        && !member.is_some_and(|m| m.at_least(MemberRank::Voice))
    {
        return Err(Some(SendDenied::Moderated));
    }
    if chan.is_banned(&masks) {
        return Err(Some(SendDenied::Banned));
    }
    if chan.modes.has('R') && account.is_none() {
        return Err(Some(SendDenied::NeedRegged));
    }
    let filtered = filter_text(&chan, text)?;
    Ok((chan.name.clone(), filtered))
}

/// Apply +C / +c / +S content filters.
fn filter_text(
    chan: &crate::state::Channel,
    text: &str,
) -> Result<String, Option<SendDenied>> {
    const CTCP: char = '\u{1}';
    if chan.modes.has('C') && text.starts_with(CTCP) && !text.starts_with("\u{1}ACTION") {
        return Err(Some(SendDenied::BlockedCtcp));
    }
    if chan.modes.has('S') {
        return Ok(strip_formatting(text, true));
    }
    if chan.modes.has('c') {
        return Ok(strip_formatting(text, false));
    }
    Ok(text.to_string())
}

/// Remove mIRC color codes; with `all`, every formatting control code.
fn strip_formatting(text: &str, all: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            // Color: \x03 [fg [, bg]]
            '\u{3}' => {
                for _ in 0..2 {
                    if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                        chars.next();
                    }
                }
                if chars.peek() == Some(&',') {
                    chars.next();
                    for _ in 0..2 {
                        if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                            chars.next();
                        }
                    }
                }
            }
            // Bold, italic, underline, strikethrough, monospace, reverse,
            // reset.
            '\u{2}' | '\u{1d}' | '\u{1f}' | '\u{1e}' | '\u{11}' | '\u{16}' | '\u{f}' if all => {}
            c => out.push(c),
        }
    }
    out
}

fn new_msgid() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        crate::broker::batch_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colors_only() {
        let text = "\u{3}04red\u{3} plain \u{2}bold\u{2}";
        assert_eq!(strip_formatting(text, false), "red plain \u{2}bold\u{2}");
    }

    #[test]
    fn strips_all_formatting() {
        let text = "\u{3}04,12x\u{3} \u{2}b\u{1d}i\u{1f}u\u{f}";
        assert_eq!(strip_formatting(text, true), "x biu");
    }
}
