//! User queries and status: WHO, WHOIS, WHOWAS, USERHOST, ISON, AWAY.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use async_trait::async_trait;
use lattice_proto::ident::ChannelName;
use lattice_proto::message::Source;
use lattice_proto::{irc_to_lower, Message, Response};

pub struct WhoHandler;

#[async_trait]
impl Handler for WhoHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let mask = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();

        if ChannelName::is_channel_like(&mask) {
            who_channel(ctx, &mask).await;
        } else if let Some((_uid, user_arc)) = ctx.fabric.user_by_nick(&mask).await {
            let user = user_arc.read().await;
            let flags = who_flags(user.away.is_some(), user.is_oper(), "");
            let (nick, username, host, realname) = (
                user.nick.clone(),
                user.user.clone(),
                user.visible_host.clone(),
                user.realname.clone(),
            );
            drop(user);
            let server = ctx.server_name().to_string();
            ctx.numeric(
                Response::RPL_WHOREPLY,
                [
                    "*".to_string(),
                    username,
                    host,
                    server,
                    nick,
                    flags,
                    format!("0 {}", realname),
                ],
            );
        }
        ctx.numeric(Response::RPL_ENDOFWHO, [mask.as_str(), "End of /WHO list"]);
        Ok(())
    }
}

async fn who_channel(ctx: &mut Context<'_>, mask: &str) {
    let folded = irc_to_lower(mask);
    let Some(chan_arc) = ctx.fabric.channel(&folded) else {
        return;
    };
    let (display, member_list): (String, Vec<(String, String)>) = {
        let chan = chan_arc.read().await;
        // Secret channels are invisible to non-members.
        if chan.modes.has('s') && !chan.members.contains_key(ctx.uid) {
            return;
        }
        (
            chan.name.clone(),
            chan.members
                .iter()
                .map(|(uid, m)| {
                    (
                        uid.clone(),
                        m.modes.prefix_char().map(String::from).unwrap_or_default(),
                    )
                })
                .collect(),
        )
    };
    let server = ctx.server_name().to_string();
    for (uid, prefix) in member_list {
        let Some(user_arc) = ctx.fabric.user_by_uid(&uid) else {
            continue;
        };
        let user = user_arc.read().await;
        let flags = who_flags(user.away.is_some(), user.is_oper(), &prefix);
        let (nick, username, host, realname) = (
            user.nick.clone(),
            user.user.clone(),
            user.visible_host.clone(),
            user.realname.clone(),
        );
        drop(user);
        ctx.numeric(
            Response::RPL_WHOREPLY,
            [
                display.clone(),
                username,
                host,
                server.clone(),
                nick,
                flags,
                format!("0 {}", realname),
            ],
        );
    }
}

fn who_flags(away: bool, oper: bool, prefix: &str) -> String {
    let mut flags = String::from(if away { "G" } else { "H" });
    if oper {
        flags.push('*');
    }
    flags.push_str(prefix);
    flags
}

pub struct WhoisHandler;

#[async_trait]
impl Handler for WhoisHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        // WHOIS [server] <nick>: the last parameter is the nick.
        let target = msg
            .params
            .last()
            .ok_or(HandlerError::NeedMoreParams)?
            .clone();

        let Some((uid, user_arc)) = ctx.fabric.user_by_nick(&target).await else {
            ctx.numeric(Response::ERR_NOSUCHNICK, [target.as_str(), "No such nick/channel"]);
            ctx.numeric(Response::RPL_ENDOFWHOIS, [target.as_str(), "End of /WHOIS list"]);
            return Ok(());
        };

        let user = user_arc.read().await;
        let nick = user.nick.clone();
        ctx.numeric(
            Response::RPL_WHOISUSER,
            [
                nick.clone(),
                user.user.clone(),
                user.visible_host.clone(),
                "*".to_string(),
                user.realname.clone(),
            ],
        );

        // Channel list, hiding secret channels the asker cannot see.
        let mut visible = Vec::new();
        for folded in &user.channels {
            if let Some(chan_arc) = ctx.fabric.channel(folded) {
                let chan = chan_arc.read().await;
                if chan.modes.has('s') && !chan.members.contains_key(ctx.uid) {
                    continue;
                }
                let prefix = chan
                    .member_modes(&uid)
                    .and_then(|m| m.prefix_char())
                    .map(String::from)
                    .unwrap_or_default();
                visible.push(format!("{}{}", prefix, chan.name));
            }
        }
        if !visible.is_empty() {
            ctx.numeric(
                Response::RPL_WHOISCHANNELS,
                [nick.clone(), visible.join(" ")],
            );
        }

        ctx.numeric(
            Response::RPL_WHOISSERVER,
            [
                nick.clone(),
                ctx.fabric.server.name.clone(),
                ctx.fabric.server.description.clone(),
            ],
        );
        if user.is_oper() {
            ctx.numeric(
                Response::RPL_WHOISOPERATOR,
                [nick.clone(), "is an IRC operator".to_string()],
            );
        }
        if let Some(account) = &user.account {
            ctx.numeric(
                Response::RPL_WHOISACCOUNT,
                [nick.clone(), account.clone(), "is logged in as".to_string()],
            );
        }
        if let Some(away) = &user.away {
            ctx.numeric(Response::RPL_AWAY, [nick.clone(), away.clone()]);
        }
        if ctx.fabric.is_local(&uid) {
            let idle = chrono::Utc::now().timestamp() - user.last_activity;
            ctx.numeric(
                Response::RPL_WHOISIDLE,
                [
                    nick.clone(),
                    idle.max(0).to_string(),
                    user.connected_at.to_string(),
                    "seconds idle, signon time".to_string(),
                ],
            );
        }
        drop(user);
        ctx.numeric(Response::RPL_ENDOFWHOIS, [nick, "End of /WHOIS list".to_string()]);
        Ok(())
    }
}

pub struct WhowasHandler;

#[async_trait]
impl Handler for WhowasHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let count = msg
            .arg(1)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(usize::MAX);

        let entries = ctx.fabric.whowas_of(&target);
        if entries.is_empty() {
            ctx.numeric(
                Response::ERR_WASNOSUCHNICK,
                [target.as_str(), "There was no such nickname"],
            );
        }
        for entry in entries.iter().take(count) {
            ctx.numeric(
                Response::RPL_WHOWASUSER,
                [
                    entry.nick.clone(),
                    entry.user.clone(),
                    entry.host.clone(),
                    "*".to_string(),
                    entry.realname.clone(),
                ],
            );
            ctx.numeric(
                Response::RPL_WHOISSERVER,
                [
                    entry.nick.clone(),
                    entry.server.clone(),
                    chrono::DateTime::from_timestamp_millis(entry.logout_time)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default(),
                ],
            );
        }
        ctx.numeric(
            Response::RPL_ENDOFWHOWAS,
            [target.as_str(), "End of WHOWAS"],
        );
        Ok(())
    }
}

pub struct UserhostHandler;

#[async_trait]
impl Handler for UserhostHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let mut replies = Vec::new();
        for nick in msg.params.iter().take(5) {
            if let Some((_, user_arc)) = ctx.fabric.user_by_nick(nick).await {
                let user = user_arc.read().await;
                let oper = if user.is_oper() { "*" } else { "" };
                let away = if user.away.is_some() { "-" } else { "+" };
                replies.push(format!(
                    "{}{}={}{}@{}",
                    user.nick, oper, away, user.user, user.visible_host
                ));
            }
        }
        ctx.numeric(Response::RPL_USERHOST, [replies.join(" ")]);
        Ok(())
    }
}

pub struct IsonHandler;

#[async_trait]
impl Handler for IsonHandler {
    fn min_params(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let mut online = Vec::new();
        for nick in &msg.params {
            for word in nick.split_whitespace() {
                if let Some((_, user_arc)) = ctx.fabric.user_by_nick(word).await {
                    online.push(user_arc.read().await.nick.clone());
                }
            }
        }
        ctx.numeric(Response::RPL_ISON, [online.join(" ")]);
        Ok(())
    }
}

pub struct AwayHandler;

#[async_trait]
impl Handler for AwayHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;
        let message = msg.arg(0).filter(|m| !m.is_empty()).map(str::to_string);

        let (source, away_now) = {
            let mut user = user_arc.write().await;
            user.away = message.clone();
            (user.source(), user.away.clone())
        };

        match &away_now {
            Some(_) => ctx.numeric(Response::RPL_NOWAWAY, ["You have been marked as being away"]),
            None => ctx.numeric(
                Response::RPL_UNAWAY,
                ["You are no longer marked as being away"],
            ),
        }

        // away-notify fan-out to everyone sharing a channel.
        let line = match &away_now {
            Some(text) => Message::cmd("AWAY", [text.as_str()]).with_source(source),
            None => Message::cmd("AWAY", [] as [&str; 0]).with_source(source),
        };
        for peer in ctx.fabric.local_peers_of(ctx.uid).await {
            if let Some(handle) = ctx.fabric.senders.get(&peer) {
                if handle.caps.read().contains("away-notify") {
                    ctx.fabric.deliver(&peer, &handle, &std::sync::Arc::new(line.clone()));
                }
            }
        }

        // Peers learn away state for WHOIS of remote users.
        let mut s2s = Message::cmd("AWAY", [] as [&str; 0])
            .with_source(Source::Name(ctx.uid.to_string()));
        if let Some(text) = &away_now {
            s2s.params.push(text.clone());
        }
        ctx.fabric.broadcast_network(s2s, None).await;
        Ok(())
    }
}
