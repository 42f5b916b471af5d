//! MODE: channel and user mode changes.
//!
//! Channel modes apply strictly left to right, consuming arguments per
//! mode type; unknown characters answer 472 in position. Authorization is
//! rank-based: HalfOp+ for ordinary modes, Op+ to grant or revoke op,
//! Owner for the owner/admin ranks.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{Channel, ListEntry};
use async_trait::async_trait;
use lattice_proto::ident::ChannelName;
use lattice_proto::message::Source;
use lattice_proto::modes::{channel_mode_kind, parse_channel_modes, ModeArgKind, ModeChange};
use lattice_proto::{irc_to_lower, MemberRank, Message, Response, UserModes};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ModeHandler;

#[async_trait]
impl Handler for ModeHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        if ChannelName::is_channel_like(&target) {
            handle_channel_mode(ctx, &target, msg).await
        } else {
            handle_user_mode(ctx, &target, msg).await
        }
    }
}

// ============================================================================
// Channel modes
// ============================================================================

async fn handle_channel_mode(
    ctx: &mut Context<'_>,
    target: &str,
    msg: &Message,
) -> HandlerResult {
    let folded = irc_to_lower(target);
    let Some(chan_arc) = ctx.fabric.channel(&folded) else {
        ctx.numeric(Response::ERR_NOSUCHCHANNEL, [target, "No such channel"]);
        return Ok(());
    };

    let Some(modestring) = msg.arg(1) else {
        // Query: current modes plus creation time.
        let chan = chan_arc.read().await;
        let mut mode_str = chan.modes.to_string();
        let mut args: Vec<String> = Vec::new();
        if chan.key.is_some() {
            mode_str.push('k');
            // Key argument only shown to members.
            if chan.members.contains_key(ctx.uid) {
                args.push(chan.key.clone().unwrap_or_default());
            }
        }
        if let Some(limit) = chan.limit {
            mode_str.push('l');
            args.push(limit.to_string());
        }
        let (name, created) = (chan.name.clone(), chan.created_at);
        drop(chan);
        let mut params = vec![name.clone(), mode_str];
        params.extend(args);
        ctx.numeric(Response::RPL_CHANNELMODEIS, params);
        ctx.numeric(Response::RPL_CREATIONTIME, [name, created.to_string()]);
        return Ok(());
    };

    let extra: Vec<&str> = msg.params.iter().skip(2).map(String::as_str).collect();
    let changes = parse_channel_modes(modestring, &extra);
    if changes.is_empty() {
        return Ok(());
    }

    let applied =
        apply_channel_changes(ctx, &chan_arc, changes, ApplyActor::Client).await?;
    if applied.is_empty() {
        return Ok(());
    }

    let (nick, username, host) = ctx
        .source_parts()
        .await
        .ok_or(HandlerError::NotRegistered)?;
    let (mode_str, args) = format_changes(&applied);
    let display = chan_arc.read().await.name.clone();
    let mut params = vec![display.clone(), mode_str.clone()];
    params.extend(args.iter().cloned());
    let line = Message::cmd("MODE", params).with_source(Source::User {
        nick,
        user: username,
        host,
    });
    ctx.reply(line.clone());
    ctx.fabric
        .send_to_channel(&folded, line, Some(ctx.uid))
        .await;

    // TMODE carries the channel TS so peers can reject stale changes.
    let ts = chan_arc.read().await.created_at;
    let mut s2s_params = vec![ts.to_string(), display, mode_str];
    s2s_params.extend(args);
    ctx.fabric
        .broadcast_network(
            Message::cmd("TMODE", s2s_params)
                .with_source(Source::Name(ctx.uid.to_string())),
            None,
        )
        .await;
    Ok(())
}

/// Who is driving a mode application.
pub enum ApplyActor {
    /// The connection in the context; rank checks apply.
    Client,
    /// A peer server or internal actor; trusted.
    Server,
}

/// Apply parsed mode changes to a channel, answering list queries and
/// permission errors along the way. Returns the changes that took effect.
pub async fn apply_channel_changes(
    ctx: &mut Context<'_>,
    chan_arc: &Arc<RwLock<Channel>>,
    changes: Vec<ModeChange>,
    actor: ApplyActor,
) -> Result<Vec<ModeChange>, HandlerError> {
    let mut chan = chan_arc.write().await;

    let actor_rank = match actor {
        ApplyActor::Server => MemberRank::Owner,
        ApplyActor::Client => {
            let Some(modes) = chan.member_modes(ctx.uid) else {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_NOTONCHANNEL,
                    [name.as_str(), "You're not on that channel"],
                );
                return Ok(Vec::new());
            };
            modes.highest()
        }
    };

    let setter = ctx.nick().to_string();
    let now = chrono::Utc::now().timestamp();
    let mut applied = Vec::new();

    for change in changes {
        let kind = channel_mode_kind(change.mode);
        let Some(kind) = kind else {
            let name = chan.name.clone();
            ctx.numeric(
                Response::ERR_UNKNOWNMODE,
                [
                    change.mode.to_string(),
                    format!("is unknown mode char to me for {}", name),
                ],
            );
            continue;
        };

        // List query form (bare +b / +e / +I).
        if kind == ModeArgKind::List && change.arg.is_none() {
            send_list(ctx, &chan, change.mode);
            continue;
        }

        let required = required_rank(change.mode);
        if actor_rank < required {
            let name = chan.name.clone();
            ctx.numeric(
                Response::ERR_CHANOPRIVSNEEDED,
                [name.as_str(), "You're not channel operator"],
            );
            continue;
        }

        let took_effect = match kind {
            ModeArgKind::List => {
                let mask = change.arg.clone().unwrap_or_default();
                let list = match change.mode {
                    'b' => &mut chan.bans,
                    'e' => &mut chan.excepts,
                    _ => &mut chan.invex,
                };
                if change.adding {
                    Channel::add_list_entry(
                        list,
                        ListEntry {
                            mask,
                            set_by: setter.clone(),
                            set_at: now,
                        },
                    )
                } else {
                    Channel::remove_list_entry(list, &mask)
                }
            }
            ModeArgKind::AlwaysParam if change.mode == 'k' => {
                if change.adding {
                    chan.key = change.arg.clone();
                } else {
                    chan.key = None;
                }
                true
            }
            ModeArgKind::AlwaysParam => {
                // Member rank modes.
                apply_member_mode(ctx, &mut chan, &change)
            }
            ModeArgKind::ParamWhenSet => {
                if change.adding {
                    match change.arg.as_deref().and_then(|a| a.parse::<u32>().ok()) {
                        Some(limit) if limit > 0 => {
                            chan.limit = Some(limit);
                            true
                        }
                        _ => false,
                    }
                } else {
                    let had = chan.limit.is_some();
                    chan.limit = None;
                    had
                }
            }
            ModeArgKind::Flag => chan.modes.set(change.mode, change.adding),
        };

        if took_effect {
            applied.push(change);
        }
    }

    Ok(applied)
}

/// Minimum rank to change a given channel mode.
fn required_rank(mode: char) -> MemberRank {
    match mode {
        'q' | 'a' => MemberRank::Owner,
        'o' => MemberRank::Op,
        _ => MemberRank::HalfOp,
    }
}

/// Grant or revoke a member rank; target must be a member.
fn apply_member_mode(ctx: &mut Context<'_>, chan: &mut Channel, change: &ModeChange) -> bool {
    let Some(rank) = MemberRank::from_mode_char(change.mode) else {
        return false;
    };
    let Some(target_nick) = change.arg.as_deref() else {
        return false;
    };
    let Some(target_uid) = ctx.fabric.uid_by_nick(target_nick) else {
        ctx.numeric(
            Response::ERR_NOSUCHNICK,
            [target_nick, "No such nick/channel"],
        );
        return false;
    };
    let name = chan.name.clone();
    let Some(member) = chan.members.get_mut(&target_uid) else {
        ctx.numeric(
            Response::ERR_USERNOTINCHANNEL,
            [target_nick, name.as_str(), "They aren't on that channel"],
        );
        return false;
    };
    if change.adding {
        member.modes.grant(rank);
    } else {
        member.modes.revoke(rank);
    }
    true
}

fn send_list(ctx: &mut Context<'_>, chan: &Channel, mode: char) {
    let name = chan.name.clone();
    let (list, item, end, end_text): (&[ListEntry], Response, Response, &str) = match mode {
        'b' => (
            &chan.bans,
            Response::RPL_BANLIST,
            Response::RPL_ENDOFBANLIST,
            "End of channel ban list",
        ),
        'e' => (
            &chan.excepts,
            Response::RPL_EXCEPTLIST,
            Response::RPL_ENDOFEXCEPTLIST,
            "End of channel exception list",
        ),
        _ => (
            &chan.invex,
            Response::RPL_INVITELIST,
            Response::RPL_ENDOFINVITELIST,
            "End of channel invite exception list",
        ),
    };
    for entry in list {
        ctx.numeric(
            item,
            [
                name.clone(),
                entry.mask.clone(),
                entry.set_by.clone(),
                entry.set_at.to_string(),
            ],
        );
    }
    ctx.numeric(end, [name.as_str(), end_text]);
}

/// Render applied changes back into `±modes args` wire form.
pub fn format_changes(changes: &[ModeChange]) -> (String, Vec<String>) {
    let mut mode_str = String::new();
    let mut args = Vec::new();
    let mut current_sign: Option<bool> = None;
    for change in changes {
        if current_sign != Some(change.adding) {
            mode_str.push(if change.adding { '+' } else { '-' });
            current_sign = Some(change.adding);
        }
        mode_str.push(change.mode);
        // `-l` consumed no argument; everything else with an arg shows it.
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    (mode_str, args)
}

// ============================================================================
// User modes
// ============================================================================

async fn handle_user_mode(ctx: &mut Context<'_>, target: &str, msg: &Message) -> HandlerResult {
    if !lattice_proto::irc_eq(target, ctx.nick()) {
        ctx.numeric(
            Response::ERR_USERSDONTMATCH,
            ["Cannot change mode for other users"],
        );
        return Ok(());
    }
    let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;

    let Some(modestring) = msg.arg(1) else {
        let modes = user_arc.read().await.modes.to_string();
        ctx.numeric(Response::RPL_UMODEIS, [modes]);
        return Ok(());
    };

    let mut adding = true;
    let mut applied = String::new();
    let mut applied_sign: Option<bool> = None;
    {
        let mut user = user_arc.write().await;
        for c in modestring.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                // +o is only granted through OPER; -o is honored.
                UserModes::OPER if adding => {}
                // +r/-r tracks account state, not client requests.
                UserModes::REGISTERED => {}
                c => {
                    if user.modes.has(c) != adding && user.modes.set(c, adding) {
                        if applied_sign != Some(adding) {
                            applied.push(if adding { '+' } else { '-' });
                            applied_sign = Some(adding);
                        }
                        applied.push(c);
                    } else if UserModes::supported().find(c).is_none() {
                        ctx.numeric(
                            Response::ERR_UMODEUNKNOWNFLAG,
                            ["Unknown MODE flag"],
                        );
                    }
                }
            }
        }
    }

    if !applied.is_empty() {
        let nick = ctx.nick().to_string();
        let line = Message::cmd("MODE", [nick.as_str(), applied.as_str()])
            .with_source(Source::Name(nick.clone()));
        ctx.reply(line);
        crate::metrics::OPERATORS_ONLINE.set(count_opers(ctx).await as i64);
    }
    Ok(())
}

async fn count_opers(ctx: &Context<'_>) -> usize {
    let user_arcs: Vec<_> = ctx
        .fabric
        .users
        .iter()
        .map(|e| e.value().clone())
        .collect();
    let mut count = 0;
    for user_arc in user_arcs {
        if user_arc.read().await.is_oper() {
            count += 1;
        }
    }
    count
}
