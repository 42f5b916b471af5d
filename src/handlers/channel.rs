//! Channel membership commands: JOIN, PART, KICK, INVITE, TOPIC, NAMES,
//! LIST.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{Channel, Fabric, Topic, UserEvent, UserEventKind};
use crate::triggers::{TriggerContext, TriggerEvent};
use async_trait::async_trait;
use lattice_proto::ident::{ChannelName, ServerId};
use lattice_proto::message::Source;
use lattice_proto::{irc_to_lower, MemberRank, Message, Response};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let targets = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();

        // `JOIN 0` parts every channel.
        if targets == "0" {
            let channels: Vec<String> = match ctx.user() {
                Some(user_arc) => user_arc.read().await.channels.iter().cloned().collect(),
                None => Vec::new(),
            };
            for folded in channels {
                part_one(ctx, &folded, None).await?;
            }
            return Ok(());
        }

        let keys: Vec<&str> = msg.arg(1).map(|k| k.split(',').collect()).unwrap_or_default();
        for (i, raw) in targets.split(',').filter(|t| !t.is_empty()).enumerate() {
            join_one(ctx, raw, keys.get(i).copied()).await?;
        }
        Ok(())
    }
}

async fn join_one(ctx: &mut Context<'_>, raw: &str, key: Option<&str>) -> HandlerResult {
    let max = ctx.fabric.config().limits.max_channel_length;
    let name = match ChannelName::parse(raw) {
        Ok(name) if name.as_str().len() <= max => name,
        _ => {
            ctx.numeric(Response::ERR_BADCHANMASK, [raw, "Bad Channel Mask"]);
            return Ok(());
        }
    };

    let outcome = match ctx.fabric.join_channel(ctx.uid, &name, key).await {
        Ok(outcome) => outcome,
        Err(denied) => {
            ctx.numeric(denied.numeric(), [name.as_str(), denied.text()]);
            return Ok(());
        }
    };
    if outcome.already_member {
        return Ok(());
    }

    let (nick, username, host) = ctx
        .source_parts()
        .await
        .ok_or(HandlerError::NotRegistered)?;
    let (account, realname) = {
        let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;
        let user = user_arc.read().await;
        (user.account.clone(), user.realname.clone())
    };
    let source = Source::User {
        nick: nick.clone(),
        user: username,
        host: host.clone(),
    };

    // Self always sees the JOIN; other members see the plain or
    // extended-join form depending on their own capabilities.
    let plain = Message::cmd("JOIN", [name.as_str()]).with_source(source.clone());
    let extended = Message::cmd(
        "JOIN",
        [
            name.as_str().to_string(),
            account.clone().unwrap_or_else(|| "*".to_string()),
            realname,
        ],
    )
    .with_source(source);
    ctx.reply(if ctx.session.has_cap("extended-join") {
        extended.clone()
    } else {
        plain.clone()
    });
    fanout_by_cap(ctx.fabric, name.folded(), ctx.uid, "extended-join", &extended, &plain).await;

    // Topic and names for the joiner.
    let chan_ts = {
        let chan = outcome.channel.read().await;
        match &chan.topic {
            Some(topic) => {
                ctx.numeric(
                    Response::RPL_TOPIC,
                    [name.as_str(), topic.text.as_str()],
                );
                ctx.numeric(
                    Response::RPL_TOPICWHOTIME,
                    [
                        name.as_str().to_string(),
                        topic.set_by.clone(),
                        topic.set_at.to_string(),
                    ],
                );
            }
            None => {
                ctx.numeric(Response::RPL_NOTOPIC, [name.as_str(), "No topic is set"]);
            }
        }
        chan.created_at
    };
    send_names(ctx, &outcome.channel).await;

    // Announce membership mode if one was granted on entry.
    if let Some(mode_char) = outcome.granted.highest().mode_char() {
        let change = format!("+{}", mode_char);
        let line = Message::cmd("MODE", [name.as_str(), change.as_str(), nick.as_str()])
            .from_server(&ctx.fabric.server.name);
        ctx.fabric
            .send_to_channel(name.folded(), line, None)
            .await;
    }

    // Relay to peers as a one-member SJOIN carrying the channel TS.
    let prefix: String = outcome
        .granted
        .all_prefix_chars();
    let sjoin = Message::cmd(
        "SJOIN",
        [
            chan_ts.to_string(),
            name.as_str().to_string(),
            "+".to_string(),
            format!("{}{}", prefix, ctx.uid),
        ],
    )
    .with_source(Source::Name(ctx.fabric.server.sid.as_str().to_string()));
    ctx.fabric.broadcast_network(sjoin, None).await;

    ctx.fabric.events.publish(
        UserEvent::now(UserEventKind::Join, &nick, &host).in_channel(name.as_str()),
    );
    run_triggers(ctx, TriggerEvent::Join, Some(name.as_str()), "").await;
    Ok(())
}

/// Fan a message to local channel members, choosing between two renderings
/// by capability. The sender is excluded (they already got their copy).
pub async fn fanout_by_cap(
    fabric: &Arc<Fabric>,
    folded: &str,
    sender: &str,
    cap: &str,
    with_cap: &Message,
    without_cap: &Message,
) {
    let Some(chan_arc) = fabric.channel(folded) else {
        return;
    };
    let members: Vec<String> = {
        let chan = chan_arc.read().await;
        chan.members.keys().cloned().collect()
    };
    let with_arc = Arc::new(with_cap.clone());
    let without_arc = Arc::new(without_cap.clone());
    for uid in members {
        if uid == sender {
            continue;
        }
        if let Some(handle) = fabric.senders.get(&uid) {
            let msg = if handle.caps.read().contains(cap) {
                &with_arc
            } else {
                &without_arc
            };
            fabric.deliver(&uid, &handle, msg);
        }
    }
}

pub struct PartHandler;

#[async_trait]
impl Handler for PartHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let targets = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let reason = msg.arg(1).map(str::to_string);
        for raw in targets.split(',').filter(|t| !t.is_empty()) {
            part_one(ctx, &irc_to_lower(raw), reason.as_deref()).await?;
        }
        Ok(())
    }
}

async fn part_one(ctx: &mut Context<'_>, folded: &str, reason: Option<&str>) -> HandlerResult {
    let Some(chan_arc) = ctx.fabric.channel(folded) else {
        ctx.numeric(Response::ERR_NOSUCHCHANNEL, [folded, "No such channel"]);
        return Ok(());
    };
    let display = {
        let chan = chan_arc.read().await;
        if !chan.members.contains_key(ctx.uid) {
            let name = chan.name.clone();
            drop(chan);
            ctx.numeric(
                Response::ERR_NOTONCHANNEL,
                [name.as_str(), "You're not on that channel"],
            );
            return Ok(());
        }
        chan.name.clone()
    };

    let (nick, username, host) = ctx
        .source_parts()
        .await
        .ok_or(HandlerError::NotRegistered)?;
    let source = Source::User {
        nick: nick.clone(),
        user: username,
        host: host.clone(),
    };
    let mut params = vec![display.clone()];
    if let Some(reason) = reason {
        params.push(reason.to_string());
    }
    let line = Message::cmd("PART", params).with_source(source);

    // Everyone, including the leaver, sees the PART before the membership
    // disappears.
    ctx.reply(line.clone());
    ctx.fabric
        .send_to_channel(folded, line, Some(ctx.uid))
        .await;
    ctx.fabric.leave_channel(ctx.uid, folded).await;

    let mut s2s = vec![display.clone()];
    if let Some(reason) = reason {
        s2s.push(reason.to_string());
    }
    ctx.fabric
        .broadcast_network(
            Message::cmd("PART", s2s).with_source(Source::Name(ctx.uid.to_string())),
            None,
        )
        .await;

    ctx.fabric.events.publish(
        UserEvent::now(UserEventKind::Part, &nick, &host).in_channel(&display),
    );
    run_triggers(ctx, TriggerEvent::Part, Some(&display), "").await;
    Ok(())
}

pub struct KickHandler;

#[async_trait]
impl Handler for KickHandler {
    fn min_params(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let chan_raw = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let targets = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let reason = msg
            .arg(2)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.nick().to_string());
        let folded = irc_to_lower(&chan_raw);

        let Some(chan_arc) = ctx.fabric.channel(&folded) else {
            ctx.numeric(Response::ERR_NOSUCHCHANNEL, [chan_raw.as_str(), "No such channel"]);
            return Ok(());
        };

        for target in targets.split(',').filter(|t| !t.is_empty()) {
            kick_one(ctx, &chan_arc, &folded, target, &reason).await?;
        }
        Ok(())
    }
}

async fn kick_one(
    ctx: &mut Context<'_>,
    chan_arc: &Arc<RwLock<Channel>>,
    folded: &str,
    target_nick: &str,
    reason: &str,
) -> HandlerResult {
    let Some(target_uid) = ctx.fabric.uid_by_nick(target_nick) else {
        ctx.numeric(Response::ERR_NOSUCHNICK, [target_nick, "No such nick/channel"]);
        return Ok(());
    };

    let display = {
        let chan = chan_arc.read().await;
        let Some(actor) = chan.member_modes(ctx.uid) else {
            let name = chan.name.clone();
            drop(chan);
            ctx.numeric(
                Response::ERR_NOTONCHANNEL,
                [name.as_str(), "You're not on that channel"],
            );
            return Ok(());
        };
        if !chan.members.contains_key(&target_uid) {
            let name = chan.name.clone();
            drop(chan);
            ctx.numeric(
                Response::ERR_USERNOTINCHANNEL,
                [target_nick, name.as_str(), "They aren't on that channel"],
            );
            return Ok(());
        }
        let target_rank = chan.rank_of(&target_uid);
        if !actor.at_least(MemberRank::HalfOp) || target_rank > actor.highest() {
            let name = chan.name.clone();
            drop(chan);
            ctx.numeric(
                Response::ERR_CHANOPRIVSNEEDED,
                [name.as_str(), "You're not channel operator"],
            );
            return Ok(());
        }
        chan.name.clone()
    };

    let (nick, username, host) = ctx
        .source_parts()
        .await
        .ok_or(HandlerError::NotRegistered)?;
    let line = Message::cmd("KICK", [display.as_str(), target_nick, reason])
        .with_source(Source::User {
            nick: nick.clone(),
            user: username,
            host: host.clone(),
        });

    ctx.reply(line.clone());
    ctx.fabric
        .send_to_channel(folded, line, Some(ctx.uid))
        .await;
    ctx.fabric.leave_channel(&target_uid, folded).await;

    ctx.fabric
        .broadcast_network(
            Message::cmd("KICK", [display.as_str(), target_uid.as_str(), reason])
                .with_source(Source::Name(ctx.uid.to_string())),
            None,
        )
        .await;

    ctx.fabric.events.publish(
        UserEvent::now(UserEventKind::Kick, target_nick, "")
            .in_channel(&display)
            .with_details(reason),
    );
    Ok(())
}

pub struct InviteHandler;

#[async_trait]
impl Handler for InviteHandler {
    fn min_params(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let target_nick = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let chan_raw = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let folded = irc_to_lower(&chan_raw);

        let Some(target_uid) = ctx.fabric.uid_by_nick(&target_nick) else {
            ctx.numeric(
                Response::ERR_NOSUCHNICK,
                [target_nick.as_str(), "No such nick/channel"],
            );
            return Ok(());
        };
        let Some(chan_arc) = ctx.fabric.channel(&folded) else {
            ctx.numeric(
                Response::ERR_NOSUCHCHANNEL,
                [chan_raw.as_str(), "No such channel"],
            );
            return Ok(());
        };

        let display = {
            let mut chan = chan_arc.write().await;
            let Some(actor) = chan.member_modes(ctx.uid) else {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_NOTONCHANNEL,
                    [name.as_str(), "You're not on that channel"],
                );
                return Ok(());
            };
            if chan.members.contains_key(&target_uid) {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_USERONCHANNEL,
                    [target_nick.as_str(), name.as_str(), "is already on channel"],
                );
                return Ok(());
            }
            if chan.modes.has('i') && !actor.at_least(MemberRank::HalfOp) {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_CHANOPRIVSNEEDED,
                    [name.as_str(), "You're not channel operator"],
                );
                return Ok(());
            }
            chan.invited.insert(target_uid.clone());
            chan.name.clone()
        };

        let (nick, username, host) = ctx
            .source_parts()
            .await
            .ok_or(HandlerError::NotRegistered)?;
        ctx.numeric(
            Response::RPL_INVITING,
            [target_nick.as_str(), display.as_str()],
        );

        let invite = Message::cmd("INVITE", [target_nick.as_str(), display.as_str()])
            .with_source(Source::User {
                nick: nick.clone(),
                user: username,
                host,
            });
        if ctx.fabric.is_local(&target_uid) {
            ctx.fabric.send_to_uid(&target_uid, invite);
        } else if let Ok(sid) = ServerId::parse(&target_uid[..3]) {
            let routed = Message::cmd("INVITE", [target_uid.as_str(), display.as_str()])
                .with_source(Source::Name(ctx.uid.to_string()));
            ctx.fabric.sync.route(&sid, Arc::new(routed)).await;
        }

        // invite-notify: tell privileged members who was invited.
        let notify = Message::cmd("INVITE", [target_nick.as_str(), display.as_str()])
            .with_source(Source::Name(ctx.fabric.server.name.clone()));
        notify_privileged_with_cap(ctx.fabric, &folded, "invite-notify", &notify, ctx.uid).await;
        Ok(())
    }
}

/// Deliver to local HalfOp+ members holding a capability.
async fn notify_privileged_with_cap(
    fabric: &Arc<Fabric>,
    folded: &str,
    cap: &str,
    msg: &Message,
    except: &str,
) {
    let Some(chan_arc) = fabric.channel(folded) else {
        return;
    };
    let privileged: Vec<String> = {
        let chan = chan_arc.read().await;
        chan.members
            .iter()
            .filter(|(uid, m)| uid.as_str() != except && m.modes.at_least(MemberRank::HalfOp))
            .map(|(uid, _)| uid.clone())
            .collect()
    };
    let msg = Arc::new(msg.clone());
    for uid in privileged {
        if let Some(handle) = fabric.senders.get(&uid) {
            if handle.caps.read().contains(cap) {
                fabric.deliver(&uid, &handle, &msg);
            }
        }
    }
}

pub struct TopicHandler;

#[async_trait]
impl Handler for TopicHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let chan_raw = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let folded = irc_to_lower(&chan_raw);
        let Some(chan_arc) = ctx.fabric.channel(&folded) else {
            ctx.numeric(
                Response::ERR_NOSUCHCHANNEL,
                [chan_raw.as_str(), "No such channel"],
            );
            return Ok(());
        };

        // Query form.
        let Some(new_text) = msg.arg(1) else {
            let chan = chan_arc.read().await;
            let name = chan.name.clone();
            match &chan.topic {
                Some(topic) => {
                    let (set_by, set_at, text) =
                        (topic.set_by.clone(), topic.set_at, topic.text.clone());
                    drop(chan);
                    ctx.numeric(Response::RPL_TOPIC, [name.as_str(), text.as_str()]);
                    ctx.numeric(
                        Response::RPL_TOPICWHOTIME,
                        [name, set_by, set_at.to_string()],
                    );
                }
                None => {
                    drop(chan);
                    ctx.numeric(Response::RPL_NOTOPIC, [name.as_str(), "No topic is set"]);
                }
            }
            return Ok(());
        };

        let max = ctx.fabric.config().limits.max_topic_length;
        let mut text = new_text.to_string();
        text.truncate(max);

        let (nick, username, host) = ctx
            .source_parts()
            .await
            .ok_or(HandlerError::NotRegistered)?;
        let now = chrono::Utc::now().timestamp();
        let setter_mask = format!("{}!{}@{}", nick, username, host);

        let display = {
            let mut chan = chan_arc.write().await;
            let Some(actor) = chan.member_modes(ctx.uid) else {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_NOTONCHANNEL,
                    [name.as_str(), "You're not on that channel"],
                );
                return Ok(());
            };
            if chan.modes.has('t') && !actor.at_least(MemberRank::HalfOp) {
                let name = chan.name.clone();
                drop(chan);
                ctx.numeric(
                    Response::ERR_CHANOPRIVSNEEDED,
                    [name.as_str(), "You're not channel operator"],
                );
                return Ok(());
            }
            chan.topic = Some(Topic {
                text: text.clone(),
                set_by: setter_mask.clone(),
                set_at: now,
            });
            chan.name.clone()
        };

        let line = Message::cmd("TOPIC", [display.as_str(), text.as_str()]).with_source(
            Source::User {
                nick,
                user: username,
                host,
            },
        );
        ctx.reply(line.clone());
        ctx.fabric
            .send_to_channel(&folded, line, Some(ctx.uid))
            .await;

        ctx.fabric
            .broadcast_network(
                Message::cmd(
                    "TB",
                    [
                        display.as_str().to_string(),
                        now.to_string(),
                        setter_mask,
                        text,
                    ],
                )
                .with_source(Source::Name(ctx.fabric.server.sid.as_str().to_string())),
                None,
            )
            .await;
        Ok(())
    }
}

pub struct NamesHandler;

#[async_trait]
impl Handler for NamesHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        match msg.arg(0) {
            Some(raw) => {
                let folded = irc_to_lower(raw);
                match ctx.fabric.channel(&folded) {
                    Some(chan_arc) => send_names(ctx, &chan_arc).await,
                    None => {
                        ctx.numeric(Response::ERR_NOSUCHCHANNEL, [raw, "No such channel"]);
                    }
                }
            }
            None => {
                ctx.numeric(Response::RPL_ENDOFNAMES, ["*", "End of /NAMES list"]);
            }
        }
        Ok(())
    }
}

/// 353/366 for one channel, honoring multi-prefix and userhost-in-names.
pub async fn send_names(ctx: &mut Context<'_>, chan_arc: &Arc<RwLock<Channel>>) {
    let multi_prefix = ctx.session.has_cap("multi-prefix");
    let userhost = ctx.session.has_cap("userhost-in-names");

    let (name, symbol, members) = {
        let chan = chan_arc.read().await;
        let symbol = if chan.modes.has('s') { "@" } else { "=" };
        let members: Vec<(String, String)> = chan
            .members
            .iter()
            .map(|(uid, m)| {
                let prefix = if multi_prefix {
                    m.modes.all_prefix_chars()
                } else {
                    m.modes.prefix_char().map(String::from).unwrap_or_default()
                };
                (uid.clone(), format!("{}{}", prefix, m.nick))
            })
            .collect();
        (chan.name.clone(), symbol, members)
    };

    let mut rendered = Vec::with_capacity(members.len());
    for (uid, base) in members {
        if userhost {
            if let Some(user_arc) = ctx.fabric.user_by_uid(&uid) {
                let user = user_arc.read().await;
                rendered.push(format!("{}!{}@{}", base, user.user, user.visible_host));
                continue;
            }
        }
        rendered.push(base);
    }

    ctx.numeric(
        Response::RPL_NAMREPLY,
        [symbol, name.as_str(), rendered.join(" ").as_str()],
    );
    ctx.numeric(Response::RPL_ENDOFNAMES, [name.as_str(), "End of /NAMES list"]);
}

pub struct ListHandler;

#[async_trait]
impl Handler for ListHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        ctx.numeric(Response::RPL_LISTSTART, ["Channel", "Users Name"]);
        let channels: Vec<_> = ctx
            .fabric
            .channels
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for chan_arc in channels {
            let chan = chan_arc.read().await;
            if chan.modes.has('s') && !chan.members.contains_key(ctx.uid) {
                continue;
            }
            let topic = chan.topic.as_ref().map(|t| t.text.clone()).unwrap_or_default();
            let (name, count) = (chan.name.clone(), chan.members.len());
            drop(chan);
            ctx.numeric(
                Response::RPL_LIST,
                [name, count.to_string(), topic],
            );
        }
        ctx.numeric(Response::RPL_LISTEND, ["End of /LIST"]);
        Ok(())
    }
}

/// Evaluate configured triggers for a channel-scoped event, applying the
/// engine's actions through the ordinary delivery paths.
pub async fn run_triggers(
    ctx: &mut Context<'_>,
    event: TriggerEvent,
    channel: Option<&str>,
    message: &str,
) {
    if ctx.fabric.triggers.is_empty() {
        return;
    }
    let Some(mask) = ctx.fabric.hostmask_of(ctx.uid).await else {
        return;
    };
    let (account, operator) = match ctx.user() {
        Some(user_arc) => {
            let user = user_arc.read().await;
            (user.account.clone(), user.is_oper())
        }
        None => (None, false),
    };
    let nick = ctx.nick().to_string();
    let hostmask = mask.to_string();
    let trigger_ctx = TriggerContext {
        nick: &nick,
        hostmask: &hostmask,
        channel,
        message,
        account: account.as_deref(),
        registered: account.is_some(),
        operator,
        command: None,
    };
    for action in ctx.fabric.triggers.evaluate(event, &trigger_ctx) {
        apply_trigger_action(ctx, channel, &nick, action).await;
    }
}

async fn apply_trigger_action(
    ctx: &mut Context<'_>,
    channel: Option<&str>,
    nick: &str,
    action: crate::triggers::TriggerAction,
) {
    use crate::triggers::TriggerAction;
    let server = ctx.fabric.server.name.clone();
    match action {
        TriggerAction::Reply(text) => {
            if let Some(chan) = channel {
                let msg = Message::privmsg(chan, &text).from_server(&server);
                ctx.fabric
                    .send_to_channel(&irc_to_lower(chan), msg, None)
                    .await;
            }
        }
        TriggerAction::Notice(text) => {
            let msg = Message::notice(nick, &text).from_server(&server);
            ctx.fabric.send_to_uid(ctx.uid, msg);
        }
        TriggerAction::Kick(reason) => {
            if let Some(chan) = channel {
                let folded = irc_to_lower(chan);
                let text = if reason.is_empty() { "Triggered" } else { reason.as_str() };
                let line = Message::cmd("KICK", [chan, nick, text]).from_server(&server);
                ctx.fabric.send_to_channel(&folded, line, None).await;
                ctx.fabric.leave_channel(ctx.uid, &folded).await;
            }
        }
        TriggerAction::Mode(change) => {
            if let Some(chan) = channel {
                tracing::debug!(channel = %chan, change = %change, "Trigger mode action");
            }
        }
    }
}
