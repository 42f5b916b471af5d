//! Burst generation and application, including TS6 conflict resolution.
//!
//! On link-up each side describes its world: `SID` for every server it
//! knows, `UID` for every local user, and per channel an `SJOIN` plus
//! `BMASK`/`TB` for lists and topic. Applying the remote burst reconciles
//! duplicates:
//!
//! - **Nick collision**: the user with the lower nick timestamp survives;
//!   a tie kills both (TS6).
//! - **Channel collision**: the lower channel timestamp wins; the losing
//!   side discards its modes and its members' prefixes, and the winner's
//!   lists become authoritative.

use crate::state::{Channel, Fabric, Member, Topic, User};
use lattice_proto::ident::ServerId;
use lattice_proto::message::Source;
use lattice_proto::modes::parse_channel_modes;
use lattice_proto::{irc_to_lower, MemberModes, MemberRank, Message, UserModes};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// `:SID UID nick 1 ts modes user host ip uid account|* :realname`
pub fn uid_message(sid: &ServerId, user: &User) -> Message {
    Message::cmd(
        "UID",
        [
            user.nick.clone(),
            "1".to_string(),
            user.nick_ts.to_string(),
            user.modes.to_string(),
            user.user.clone(),
            user.visible_host.clone(),
            user.ip.clone(),
            user.uid.clone(),
            user.account.clone().unwrap_or_else(|| "*".to_string()),
            user.realname.clone(),
        ],
    )
    .with_source(Source::Name(sid.as_str().to_string()))
}

/// Everything the remote needs to mirror our state, in dependency order.
pub async fn generate_burst(fabric: &Arc<Fabric>) -> Vec<Message> {
    let sid = fabric.server.sid.clone();
    let mut lines = Vec::new();

    // 1. Servers we know, so the peer learns our view of the tree.
    for server in fabric.sync.topology.all() {
        lines.push(
            Message::cmd(
                "SID",
                [
                    server.name.clone(),
                    (server.hopcount + 1).to_string(),
                    server.sid.as_str().to_string(),
                    server.description.clone(),
                ],
            )
            .with_source(Source::Name(sid.as_str().to_string())),
        );
    }

    // 2. Local users.
    let user_arcs: Vec<_> = fabric.users.iter().map(|e| e.value().clone()).collect();
    for user_arc in user_arcs {
        let user = user_arc.read().await;
        if user.hosted_by(&sid) {
            lines.push(uid_message(&sid, &user));
        }
    }

    // 3. Channels: SJOIN with members, then lists and topic.
    let chan_arcs: Vec<_> = fabric.channels.iter().map(|e| e.value().clone()).collect();
    for chan_arc in chan_arcs {
        let chan = chan_arc.read().await;
        if chan.members.is_empty() {
            continue;
        }
        let members = chan
            .members
            .iter()
            .map(|(uid, m)| format!("{}{}", m.modes.all_prefix_chars(), uid))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(
            Message::cmd(
                "SJOIN",
                [
                    chan.created_at.to_string(),
                    chan.name.clone(),
                    chan.modes.to_string(),
                    members,
                ],
            )
            .with_source(Source::Name(sid.as_str().to_string())),
        );

        for (mode, list) in [('b', &chan.bans), ('e', &chan.excepts), ('I', &chan.invex)] {
            if list.is_empty() {
                continue;
            }
            let masks = list
                .iter()
                .map(|e| e.mask.clone())
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(
                Message::cmd(
                    "BMASK",
                    [
                        chan.created_at.to_string(),
                        chan.name.clone(),
                        mode.to_string(),
                        masks,
                    ],
                )
                .with_source(Source::Name(sid.as_str().to_string())),
            );
        }

        if let Some(topic) = &chan.topic {
            lines.push(
                Message::cmd(
                    "TB",
                    [
                        chan.name.clone(),
                        topic.set_at.to_string(),
                        topic.set_by.clone(),
                        topic.text.clone(),
                    ],
                )
                .with_source(Source::Name(sid.as_str().to_string())),
            );
        }
    }

    lines
}

// ============================================================================
// Nick collision (TS6)
// ============================================================================

/// Who survives when two users claim one nickname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionVerdict {
    /// The incoming user has the older (lower) timestamp: it wins.
    IncomingWins,
    /// The existing user is older: the incoming user is killed.
    ExistingWins,
    /// Identical timestamps: both are killed.
    BothDie,
}

pub fn resolve_collision(existing_ts: i64, incoming_ts: i64) -> CollisionVerdict {
    match incoming_ts.cmp(&existing_ts) {
        std::cmp::Ordering::Less => CollisionVerdict::IncomingWins,
        std::cmp::Ordering::Greater => CollisionVerdict::ExistingWins,
        std::cmp::Ordering::Equal => CollisionVerdict::BothDie,
    }
}

/// Apply a `UID` line from a peer. Returns the KILL lines to send back,
/// if the collision rules demand any.
pub async fn apply_uid(fabric: &Arc<Fabric>, msg: &Message) -> Vec<Message> {
    let our_sid = fabric.server.sid.as_str();
    let mut replies = Vec::new();

    let (Some(nick), Some(ts), Some(modes), Some(username), Some(host), Some(ip), Some(uid)) = (
        msg.arg(0),
        msg.arg(2).and_then(|t| t.parse::<i64>().ok()),
        msg.arg(3),
        msg.arg(4),
        msg.arg(5),
        msg.arg(6),
        msg.arg(7),
    ) else {
        tracing::warn!("Malformed UID line from peer");
        return replies;
    };
    let account = msg.arg(8).filter(|a| *a != "*").map(str::to_string);
    let realname = msg.arg(9).unwrap_or_default().to_string();

    if uid.starts_with(our_sid) {
        // A peer cannot introduce users on our SID.
        tracing::warn!(uid = %uid, "Peer tried to introduce a user with our SID");
        return replies;
    }

    let folded = irc_to_lower(nick);
    if let Some(existing_uid) = fabric.nicks.get(&folded).map(|r| r.clone()) {
        let existing_ts = match fabric.user_by_uid(&existing_uid) {
            Some(user_arc) => user_arc.read().await.nick_ts,
            None => 0,
        };
        match resolve_collision(existing_ts, ts) {
            CollisionVerdict::IncomingWins => {
                kill_existing(fabric, &existing_uid, "Nick collision (older)").await;
            }
            CollisionVerdict::ExistingWins => {
                replies.push(kill_line(our_sid, uid, "Nick collision (newer)"));
                return replies;
            }
            CollisionVerdict::BothDie => {
                kill_existing(fabric, &existing_uid, "Nick collision").await;
                replies.push(kill_line(our_sid, uid, "Nick collision"));
                return replies;
            }
        }
    }

    let mut parsed_modes = UserModes::default();
    for c in modes.chars().skip_while(|c| *c == '+') {
        parsed_modes.set(c, true);
    }

    let user = User {
        uid: uid.to_string(),
        nick: nick.to_string(),
        user: username.to_string(),
        realname,
        host: host.to_string(),
        ip: ip.to_string(),
        visible_host: host.to_string(),
        modes: parsed_modes,
        account,
        away: None,
        channels: HashSet::new(),
        caps: HashSet::new(),
        certfp: None,
        nick_ts: ts,
        connected_at: ts,
        last_activity: ts,
        privileges: Default::default(),
    };
    fabric.nicks.insert(folded, uid.to_string());
    fabric
        .users
        .insert(uid.to_string(), Arc::new(RwLock::new(user)));
    replies
}

fn kill_line(our_sid: &str, target_uid: &str, reason: &str) -> Message {
    Message::cmd("KILL", [target_uid, reason]).with_source(Source::Name(our_sid.to_string()))
}

async fn kill_existing(fabric: &Arc<Fabric>, uid: &str, reason: &str) {
    if fabric.is_local(uid) {
        fabric.disconnect_user(uid, reason).await;
    } else if let Some(removed) = fabric.remove_user(uid).await {
        // Remote loser: drop it from the graph and tell local users.
        let quit = Message::cmd("QUIT", [reason]).with_source(removed.source);
        for peer_uid in removed.audience {
            fabric.send_to_uid(&peer_uid, quit.clone());
        }
    }
}

// ============================================================================
// Channel merge (SJOIN)
// ============================================================================

/// Apply an `SJOIN` line: create or merge the channel per the channel-TS
/// rules, admit the listed members, and announce their JOINs (and the
/// loser's mode wipe) to local members.
pub async fn apply_sjoin(fabric: &Arc<Fabric>, msg: &Message) {
    if msg.params.len() < 4 {
        tracing::warn!("Malformed SJOIN from peer");
        return;
    }
    let (Some(remote_ts), Some(name)) = (
        msg.arg(0).and_then(|t| t.parse::<i64>().ok()),
        msg.arg(1),
    ) else {
        tracing::warn!("Malformed SJOIN from peer");
        return;
    };
    let modestring = msg.arg(2).unwrap_or("+").to_string();
    let mode_args: Vec<String> = msg
        .params
        .iter()
        .skip(3)
        .take(msg.params.len().saturating_sub(4))
        .cloned()
        .collect();
    let member_field = msg.params.last().cloned().unwrap_or_default();

    let folded = irc_to_lower(name);
    let chan_arc = match fabric.channels.entry(folded.clone()) {
        dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            let mut chan = Channel::new(name, remote_ts, false);
            // A burst channel starts from the remote's modes, not ours.
            chan.modes = Default::default();
            let arc = Arc::new(RwLock::new(chan));
            slot.insert(arc.clone());
            crate::metrics::ACTIVE_CHANNELS.set(fabric.channels.len() as i64);
            arc
        }
    };

    let mut joined: Vec<(String, MemberModes)> = Vec::new();
    {
        let mut chan = chan_arc.write().await;
        let local_ts = chan.created_at;
        let remote_wins = remote_ts < local_ts;
        let keep_remote_prefixes = remote_ts <= local_ts;

        if remote_wins {
            // Loser discards modes, member prefixes, and lists.
            chan.modes = Default::default();
            chan.key = None;
            chan.limit = None;
            chan.bans.clear();
            chan.excepts.clear();
            chan.invex.clear();
            for member in chan.members.values_mut() {
                member.modes = MemberModes::default();
            }
            chan.created_at = remote_ts;
        }
        if keep_remote_prefixes {
            apply_channel_modestring(&mut chan, &modestring, &mode_args);
        }

        for token in member_field.split_whitespace() {
            let (ranks, uid) = split_prefixes(token);
            let Some(user_arc) = fabric.user_by_uid(uid) else {
                tracing::debug!(uid = %uid, "SJOIN member unknown, skipping");
                continue;
            };
            let nick = {
                let mut user = user_arc.write().await;
                user.channels.insert(folded.clone());
                user.nick.clone()
            };
            let modes = if keep_remote_prefixes {
                ranks
            } else {
                MemberModes::default()
            };
            if chan
                .members
                .insert(
                    uid.to_string(),
                    Member {
                        nick,
                        modes,
                        joined_at: remote_ts,
                    },
                )
                .is_none()
            {
                joined.push((uid.to_string(), modes));
            }
        }
    }

    // Local members see each remote arrival as a JOIN.
    for (uid, _) in &joined {
        if let Some(user_arc) = fabric.user_by_uid(uid) {
            let source = user_arc.read().await.source();
            let join = Message::cmd("JOIN", [name]).with_source(source);
            fabric.send_to_channel(&folded, join, Some(uid)).await;
        }
    }
}

fn split_prefixes(token: &str) -> (MemberModes, &str) {
    let mut modes = MemberModes::default();
    let mut rest = token;
    while let Some(c) = rest.chars().next() {
        match MemberRank::from_prefix_char(c) {
            Some(rank) => {
                modes.grant(rank);
                rest = &rest[c.len_utf8()..];
            }
            None => break,
        }
    }
    (modes, rest)
}

fn apply_channel_modestring(chan: &mut Channel, modestring: &str, args: &[String]) {
    for change in parse_channel_modes(modestring, args) {
        match change.mode {
            'k' => chan.key = change.adding.then(|| change.arg.clone().unwrap_or_default()),
            'l' => {
                chan.limit = change
                    .adding
                    .then(|| change.arg.as_deref().and_then(|a| a.parse().ok()))
                    .flatten()
            }
            'b' | 'e' | 'I' => {}
            c => {
                chan.modes.set(c, change.adding);
            }
        }
    }
}

/// Apply a `TMODE` line: `ts channel modes args...`. Stale timestamps
/// (newer than the channel) are discarded.
pub async fn apply_tmode(fabric: &Arc<Fabric>, msg: &Message) {
    let (Some(ts), Some(name), Some(modestring)) = (
        msg.arg(0).and_then(|t| t.parse::<i64>().ok()),
        msg.arg(1),
        msg.arg(2),
    ) else {
        return;
    };
    let folded = irc_to_lower(name);
    let Some(chan_arc) = fabric.channel(&folded) else {
        return;
    };

    let args: Vec<String> = msg.params.iter().skip(3).cloned().collect();
    let mut announce: Option<Message> = None;
    {
        let mut chan = chan_arc.write().await;
        if ts > chan.created_at {
            return;
        }
        let mut applied_args = Vec::new();
        for change in parse_channel_modes(modestring, &args) {
            match change.mode {
                'k' => {
                    chan.key =
                        change.adding.then(|| change.arg.clone().unwrap_or_default());
                }
                'l' => {
                    chan.limit = change
                        .adding
                        .then(|| change.arg.as_deref().and_then(|a| a.parse().ok()))
                        .flatten();
                }
                'b' | 'e' | 'I' => {
                    let Some(mask) = change.arg.clone() else { continue };
                    let entry = crate::state::ListEntry {
                        mask,
                        set_by: msg
                            .source
                            .as_ref()
                            .map(|s| s.name().to_string())
                            .unwrap_or_default(),
                        set_at: chrono::Utc::now().timestamp(),
                    };
                    let list = match change.mode {
                        'b' => &mut chan.bans,
                        'e' => &mut chan.excepts,
                        _ => &mut chan.invex,
                    };
                    if change.adding {
                        Channel::add_list_entry(list, entry);
                    } else {
                        Channel::remove_list_entry(list, &entry.mask);
                    }
                }
                c if MemberRank::from_mode_char(c).is_some() => {
                    let rank = MemberRank::from_mode_char(c).unwrap();
                    let Some(target) = change.arg.as_deref() else { continue };
                    if let Some(member) = chan.members.get_mut(target) {
                        if change.adding {
                            member.modes.grant(rank);
                        } else {
                            member.modes.revoke(rank);
                        }
                        applied_args.push(member.nick.clone());
                    }
                    continue;
                }
                c => {
                    chan.modes.set(c, change.adding);
                }
            }
            if let Some(arg) = change.arg {
                applied_args.push(arg);
            }
        }

        let mut params = vec![chan.name.clone(), modestring.to_string()];
        params.extend(applied_args);
        announce = Some(
            Message::cmd("MODE", params).with_source(Source::Name(
                msg.source
                    .as_ref()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| fabric.server.name.clone()),
            )),
        );
    }
    if let Some(line) = announce {
        fabric.send_to_channel(&folded, line, None).await;
    }
}

/// Apply a `BMASK` line: bulk list update from the burst winner.
pub async fn apply_bmask(fabric: &Arc<Fabric>, msg: &Message) {
    let (Some(ts), Some(name), Some(mode), Some(masks)) = (
        msg.arg(0).and_then(|t| t.parse::<i64>().ok()),
        msg.arg(1),
        msg.arg(2).and_then(|m| m.chars().next()),
        msg.arg(3),
    ) else {
        return;
    };
    let Some(chan_arc) = fabric.channel(&irc_to_lower(name)) else {
        return;
    };
    let mut chan = chan_arc.write().await;
    if ts > chan.created_at {
        return;
    }
    let set_by = msg
        .source
        .as_ref()
        .map(|s| s.name().to_string())
        .unwrap_or_default();
    let now = chrono::Utc::now().timestamp();
    let list = match mode {
        'b' => &mut chan.bans,
        'e' => &mut chan.excepts,
        'I' => &mut chan.invex,
        _ => return,
    };
    for mask in masks.split_whitespace() {
        Channel::add_list_entry(
            list,
            crate::state::ListEntry {
                mask: mask.to_string(),
                set_by: set_by.clone(),
                set_at: now,
            },
        );
    }
}

/// Apply a `TB` (topic burst) line: adopt when we have no topic, or the
/// remote topic is older.
pub async fn apply_tb(fabric: &Arc<Fabric>, msg: &Message) {
    let (Some(name), Some(ts)) = (msg.arg(0), msg.arg(1).and_then(|t| t.parse::<i64>().ok()))
    else {
        return;
    };
    let (set_by, text) = match (msg.arg(2), msg.arg(3)) {
        (Some(set_by), Some(text)) => (set_by.to_string(), text.to_string()),
        (Some(text), None) => (String::new(), text.to_string()),
        _ => return,
    };
    let folded = irc_to_lower(name);
    let Some(chan_arc) = fabric.channel(&folded) else {
        return;
    };
    let adopted = {
        let mut chan = chan_arc.write().await;
        let adopt = match &chan.topic {
            None => true,
            Some(current) => ts < current.set_at,
        };
        if adopt {
            chan.topic = Some(Topic {
                text: text.clone(),
                set_by: set_by.clone(),
                set_at: ts,
            });
        }
        adopt
    };
    if adopted {
        let line = Message::cmd("TOPIC", [name, text.as_str()])
            .with_source(Source::Name(if set_by.is_empty() {
                fabric.server.name.clone()
            } else {
                set_by
            }));
        fabric.send_to_channel(&folded, line, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_lower_ts_wins() {
        // Local dave joined at t=100; remote bursts dave with ts=90.
        assert_eq!(resolve_collision(100, 90), CollisionVerdict::IncomingWins);
        assert_eq!(resolve_collision(90, 100), CollisionVerdict::ExistingWins);
        assert_eq!(resolve_collision(100, 100), CollisionVerdict::BothDie);
    }

    #[test]
    fn prefix_splitting() {
        let (modes, uid) = split_prefixes("@+9ZZAAAAAB");
        assert!(modes.holds(MemberRank::Op));
        assert!(modes.holds(MemberRank::Voice));
        assert_eq!(uid, "9ZZAAAAAB");

        let (modes, uid) = split_prefixes("9ZZAAAAAC");
        assert_eq!(modes, MemberModes::default());
        assert_eq!(uid, "9ZZAAAAAC");

        let (modes, uid) = split_prefixes("~9ZZAAAAAD");
        assert!(modes.holds(MemberRank::Owner));
        assert_eq!(uid, "9ZZAAAAAD");
    }
}
