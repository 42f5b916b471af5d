//! Connection lifecycle commands: NICK, USER, PASS, PING, PONG, QUIT, and
//! registration completion with the welcome burst.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::state::{UserEvent, UserEventKind};
use async_trait::async_trait;
use lattice_proto::ident::Nickname;
use lattice_proto::message::Source;
use lattice_proto::modes::isupport_chanmodes;
use lattice_proto::{MemberRank, Message, Response, UserModes};

pub struct NickHandler;

#[async_trait]
impl Handler for NickHandler {
    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let Some(raw) = msg.arg(0).filter(|s| !s.is_empty()) else {
            ctx.numeric(Response::ERR_NONICKNAMEGIVEN, ["No nickname given"]);
            return Ok(());
        };

        let max = ctx.fabric.config().limits.max_nick_length;
        let nick = match Nickname::parse(raw) {
            Ok(nick) if nick.as_str().len() <= max => nick,
            _ => {
                ctx.numeric(
                    Response::ERR_ERRONEUSNICKNAME,
                    [raw, "Erroneous nickname"],
                );
                return Ok(());
            }
        };

        if ctx.session.registered {
            return change_registered_nick(ctx, &nick).await;
        }

        // Pre-registration: reserve the name now so two half-registered
        // connections cannot both complete with it.
        if ctx.fabric.claim_nick(ctx.uid, &nick).is_err() {
            ctx.numeric(
                Response::ERR_NICKNAMEINUSE,
                [nick.as_str(), "Nickname is already in use"],
            );
            return Ok(());
        }
        if let Some(previous) = ctx.session.nick.take() {
            let folded = lattice_proto::irc_to_lower(&previous);
            if folded != nick.folded() {
                ctx.fabric.release_nick(&folded, ctx.uid);
            }
        }
        ctx.session.nick = Some(nick.as_str().to_string());

        try_complete_registration(ctx).await
    }
}

async fn change_registered_nick(ctx: &mut Context<'_>, nick: &Nickname) -> HandlerResult {
    match ctx.fabric.change_nick(ctx.uid, nick).await {
        Ok((old_source, audience)) => {
            let old_nick = old_source.name().to_string();
            ctx.session.nick = Some(nick.as_str().to_string());

            let line = Message::cmd("NICK", [nick.as_str()]).with_source(old_source);
            // The actor always sees their own NICK line.
            ctx.reply(line.clone());
            for uid in audience {
                ctx.fabric.send_to_uid(&uid, line.clone());
            }

            let ts = chrono::Utc::now().timestamp().to_string();
            ctx.fabric
                .broadcast_network(
                    Message::cmd("NICK", [nick.as_str(), ts.as_str()])
                        .with_source(Source::Name(ctx.uid.to_string())),
                    None,
                )
                .await;

            ctx.fabric.events.publish(
                UserEvent::now(UserEventKind::NickChange, nick.as_str(), "")
                    .with_details(&format!("was {}", old_nick)),
            );
            Ok(())
        }
        Err(()) => {
            ctx.numeric(
                Response::ERR_NICKNAMEINUSE,
                [nick.as_str(), "Nickname is already in use"],
            );
            Ok(())
        }
    }
}

pub struct UserHandler;

#[async_trait]
impl Handler for UserHandler {
    fn min_params(&self) -> usize {
        4
    }

    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if ctx.session.registered {
            ctx.numeric(
                Response::ERR_ALREADYREGISTERED,
                ["You may not reregister"],
            );
            return Ok(());
        }
        let username = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        let realname = msg.arg(3).ok_or(HandlerError::NeedMoreParams)?;
        ctx.session.user = Some(username.to_string());
        ctx.session.realname = Some(realname.to_string());
        try_complete_registration(ctx).await
    }
}

pub struct PassHandler;

#[async_trait]
impl Handler for PassHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if ctx.session.registered {
            ctx.numeric(
                Response::ERR_ALREADYREGISTERED,
                ["You may not reregister"],
            );
            return Ok(());
        }
        ctx.session.pass = msg.arg(0).map(str::to_string);
        Ok(())
    }
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let Some(token) = msg.arg(0) else {
            ctx.numeric(Response::ERR_NOORIGIN, ["No origin specified"]);
            return Ok(());
        };
        let server = ctx.server_name().to_string();
        ctx.reply(Message::pong(&server, token).from_server(&server));
        Ok(())
    }
}

pub struct PongHandler;

#[async_trait]
impl Handler for PongHandler {
    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        ctx.session.ping_pending = false;
        ctx.session.ping_sent_at = None;
        Ok(())
    }
}

pub struct QuitHandler;

#[async_trait]
impl Handler for QuitHandler {
    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, _ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        Err(HandlerError::Quit(msg.arg(0).map(str::to_string)))
    }
}

/// Promote the connection to a registered user once every precondition
/// holds: nick and user present, CAP closed, SASL settled. Runs the K/G/Z
/// check, admits the user into the graph, sends the welcome burst, and
/// announces the new user to the peer mesh.
pub async fn try_complete_registration(ctx: &mut Context<'_>) -> HandlerResult {
    if !ctx.session.can_register() {
        return Ok(());
    }

    let nick = ctx.session.nick.clone().ok_or(HandlerError::NotRegistered)?;
    let username = ctx.session.user.clone().ok_or(HandlerError::NotRegistered)?;
    let realname = ctx.session.realname.clone().unwrap_or_default();

    let ip = ctx.addr.ip();
    let host = ip.to_string();

    // Server bans, in precedence order.
    let now = chrono::Utc::now().timestamp();
    if let Some(ban) = ctx.fabric.bans.check(&username, &host, ip, now) {
        crate::metrics::XLINES_ENFORCED.inc();
        tracing::info!(nick = %nick, kind = %ban.kind.letter(), "Registration refused by server ban");
        ctx.numeric(
            Response::ERR_YOUREBANNEDCREEP,
            [format!("You are banned from this server: {}", ban.reason)],
        );
        ctx.reply(Message::irc_error("Closing Link: Banned"));
        return Err(HandlerError::AccessDenied);
    }

    let user = ctx.fabric.build_local_user(
        ctx.uid,
        &nick,
        &username,
        &realname,
        &host,
        &host,
        ctx.session.account.clone(),
        ctx.session.secure,
        ctx.session.certfp.clone(),
        ctx.session.caps.clone(),
    );
    let uid_line = crate::sync::burst::uid_message(&ctx.fabric.server.sid, &user);
    let visible_host = user.visible_host.clone();
    ctx.fabric.attach_user(user);

    // Mirror negotiated caps into the sender handle for fan-out paths.
    if let Some(handle) = ctx.fabric.senders.get(ctx.uid) {
        *handle.caps.write() = ctx.session.caps.clone();
    }

    ctx.session.registered = true;
    send_welcome(ctx).await;

    ctx.fabric.broadcast_network(uid_line, None).await;
    ctx.fabric
        .events
        .publish(UserEvent::now(UserEventKind::Connected, &nick, &visible_host));
    tracing::info!(uid = %ctx.uid, nick = %nick, "Client registered");
    Ok(())
}

/// The 001–005 / 251–255 / MOTD / 221 welcome burst.
async fn send_welcome(ctx: &mut Context<'_>) {
    let fabric = ctx.fabric.clone();
    let config = fabric.config();
    let nick = ctx.nick().to_string();
    let server = fabric.server.name.clone();
    let network = fabric.server.network.clone();
    let version = concat!("latticed-", env!("CARGO_PKG_VERSION"));

    ctx.numeric(
        Response::RPL_WELCOME,
        [format!("Welcome to the {} Network, {}", network, nick)],
    );
    ctx.numeric(
        Response::RPL_YOURHOST,
        [format!("Your host is {}, running version {}", server, version)],
    );
    ctx.numeric(
        Response::RPL_CREATED,
        [format!(
            "This server was created {}",
            fabric.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )],
    );
    ctx.numeric(
        Response::RPL_MYINFO,
        [
            server.clone(),
            version.to_string(),
            UserModes::supported(),
            "beIiklmnpstRcCS".to_string(),
        ],
    );
    ctx.numeric(
        Response::RPL_ISUPPORT,
        [
            format!("NETWORK={}", network),
            "CASEMAPPING=ascii".to_string(),
            format!("PREFIX={}", MemberRank::isupport_prefix()),
            format!("CHANMODES={}", isupport_chanmodes()),
            "CHANTYPES=#&".to_string(),
            format!("NICKLEN={}", config.limits.max_nick_length),
            format!("CHANNELLEN={}", config.limits.max_channel_length),
            format!("TOPICLEN={}", config.limits.max_topic_length),
            format!("MAXTARGETS={}", config.limits.max_targets),
            "are supported by this server".to_string(),
        ],
    );

    let snapshot = fabric.snapshot().await;
    let servers = snapshot.linked_servers + 1;
    ctx.numeric(
        Response::RPL_LUSERCLIENT,
        [format!(
            "There are {} users on {} servers",
            snapshot.user_count, servers
        )],
    );
    ctx.numeric(
        Response::RPL_LUSEROP,
        [
            snapshot.operators_online.to_string(),
            "operator(s) online".to_string(),
        ],
    );
    ctx.numeric(
        Response::RPL_LUSERUNKNOWN,
        [
            (snapshot.active_connections - snapshot.user_count.min(snapshot.active_connections))
                .to_string(),
            "unknown connection(s)".to_string(),
        ],
    );
    ctx.numeric(
        Response::RPL_LUSERCHANNELS,
        [
            snapshot.channel_count.to_string(),
            "channels formed".to_string(),
        ],
    );
    ctx.numeric(
        Response::RPL_LUSERME,
        [format!(
            "I have {} clients and {} servers",
            snapshot.user_count,
            fabric.sync.peers.len()
        )],
    );

    send_motd(ctx);

    // Current user modes.
    if let Some(user_arc) = ctx.user() {
        let modes = user_arc.read().await.modes.to_string();
        ctx.numeric(Response::RPL_UMODEIS, [modes]);
    }
}

/// MOTD block, shared by the welcome burst and the MOTD command.
pub fn send_motd(ctx: &mut Context<'_>) {
    let server = ctx.server_name().to_string();
    let lines = ctx.fabric.motd.clone();
    if lines.is_empty() {
        ctx.numeric(Response::ERR_NOMOTD, ["MOTD File is missing"]);
        return;
    }
    ctx.numeric(
        Response::RPL_MOTDSTART,
        [format!("- {} Message of the day - ", server)],
    );
    for line in lines {
        ctx.numeric(Response::RPL_MOTD, [format!("- {}", line)]);
    }
    ctx.numeric(Response::RPL_ENDOFMOTD, ["End of /MOTD command."]);
}
