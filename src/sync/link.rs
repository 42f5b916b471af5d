//! Peer link driver: sockets, handshake, burst exchange, and the routed
//! command loop.

use super::burst;
use super::handshake::{LinkHandshake, LinkPhase, StepOutcome};
use super::split::handle_netsplit;
use super::{LinkedServer, PeerHandle};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::state::Fabric;
use futures_util::{SinkExt, StreamExt};
use lattice_proto::ident::ServerId;
use lattice_proto::message::Source;
use lattice_proto::{irc_to_lower, LineCodec, Message, UserModes};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Outbound queue depth per peer link.
const PEER_SENDQ: usize = 4096;

/// Dial a configured peer and run the link until it dies.
pub fn connect_outbound(fabric: Arc<Fabric>, link: LinkConfig) {
    tokio::spawn(async move {
        let addr = format!("{}:{}", link.host, link.port);
        info!(peer = %link.name, addr = %addr, "Connecting to peer");
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                if let Err(e) = drive_link(fabric, stream, Some(link.clone())).await {
                    warn!(peer = %link.name, error = %e, "Peer link ended");
                }
            }
            Err(e) => {
                warn!(peer = %link.name, error = %e, "Peer connect failed");
            }
        }
    });
}

/// Bind the S2S listeners and accept incoming peer links.
pub fn start_inbound_listeners(fabric: Arc<Fabric>) {
    let config = fabric.config();
    for listener_cfg in config.server_listeners.clone() {
        let fabric = fabric.clone();
        tokio::spawn(async move {
            let addr = match listener_cfg.socket_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(error = %e, "Bad server listener address");
                    return;
                }
            };
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Cannot bind server listener");
                    return;
                }
            };
            info!(addr = %addr, "Server listener bound");
            let mut shutdown_rx = fabric.shutdown.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer_addr)) = accepted else { continue };
                        info!(addr = %peer_addr, "Inbound server connection");
                        let fabric = fabric.clone();
                        tokio::spawn(async move {
                            if let Err(e) = drive_link(fabric, stream, None).await {
                                warn!(error = %e, "Inbound peer link ended");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }
}

/// The full life of one peer link.
async fn drive_link(
    fabric: Arc<Fabric>,
    stream: TcpStream,
    dialed: Option<LinkConfig>,
) -> Result<(), LinkError> {
    let mut framed = Framed::new(stream, LineCodec::new());
    let config = fabric.config();
    let mut hs = LinkHandshake::new();
    let outbound = dialed.is_some();

    if let Some(link) = &dialed {
        // The greeting carries our send-password for this link block.
        for line in LinkHandshake::greeting(link, &fabric.server) {
            framed.send(&line).await?;
        }
    }

    // Collect the peer's PASS/CAPAB/SERVER under the handshake timer.
    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                let _ = framed
                    .send(&Message::irc_error("Closing Link: Handshake timeout"))
                    .await;
                return Err(LinkError::HandshakeTimeout);
            }
            item = framed.next() => {
                let Some(item) = item else {
                    return Err(LinkError::HandshakeTimeout);
                };
                let msg = match item {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(parse)) => {
                        debug!(error = %parse, "Dropping malformed handshake line");
                        continue;
                    }
                    Err(e) => return Err(LinkError::Io(e)),
                };
                match hs.step(&msg, &config.links) {
                    Ok(StepOutcome::Progress) => continue,
                    Ok(StepOutcome::Complete) => break,
                    Err(e) => {
                        let _ = framed
                            .send(&Message::irc_error(&format!("Closing Link: {}", e)))
                            .await;
                        return Err(e);
                    }
                }
            }
        }
    }

    let peer_sid = hs.remote_sid.clone().ok_or(LinkError::Malformed("PASS"))?;
    let peer_name = hs
        .remote_name
        .clone()
        .ok_or(LinkError::Malformed("SERVER"))?;

    // The accepting side answers with its own credentials.
    if !outbound {
        let link = hs
            .link_config(&config.links)
            .ok_or_else(|| LinkError::UnknownServer(peer_name.clone()))?
            .clone();
        for line in LinkHandshake::greeting(&link, &fabric.server) {
            framed.send(&line).await?;
        }
    }

    info!(peer = %peer_name, sid = %peer_sid, "Peer handshake complete, bursting");
    hs.phase = LinkPhase::Bursting;

    // Register the peer before bursting so routed traffic can flow.
    let (tx, mut rx) = mpsc::channel::<Arc<Message>>(PEER_SENDQ);
    fabric.sync.peers.insert(
        peer_sid.clone(),
        PeerHandle {
            sid: peer_sid.clone(),
            name: peer_name.clone(),
            tx,
        },
    );
    fabric.sync.topology.insert(LinkedServer {
        sid: peer_sid.clone(),
        name: peer_name.clone(),
        description: hs.remote_desc.clone().unwrap_or_default(),
        hopcount: 1,
        learned_from: None,
    });
    crate::metrics::LINKED_SERVERS.set(fabric.sync.topology.len() as i64);

    for line in burst::generate_burst(&fabric).await {
        framed.send(&line).await?;
    }
    // End-of-burst marker; the peer's answering PONG moves us to Linked.
    framed
        .send(
            &Message::ping(fabric.server.sid.as_str())
                .with_source(Source::Name(fabric.server.sid.as_str().to_string())),
        )
        .await?;

    let mut shutdown_rx = fabric.shutdown.subscribe();
    let result = loop {
        tokio::select! {
            item = framed.next() => {
                let Some(item) = item else {
                    break Ok(());
                };
                let msg = match item {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(parse)) => {
                        debug!(error = %parse, "Dropping malformed peer line");
                        continue;
                    }
                    Err(e) => break Err(LinkError::Io(e)),
                };
                match handle_peer_message(&fabric, &peer_sid, &mut hs, msg).await {
                    Ok(replies) => {
                        for reply in replies {
                            if framed.send(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = framed
                            .send(&Message::irc_error(&format!("Closing Link: {}", e)))
                            .await;
                        break Err(e);
                    }
                }
            }
            out = rx.recv() => {
                let Some(out) = out else { break Ok(()) };
                if framed.send(&*out).await.is_err() {
                    break Ok(());
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = framed.send(&Message::irc_error("Server shutting down")).await;
                break Ok(());
            }
        }
    };

    // Whatever ended the link, the cascade must run before this task
    // processes anything else.
    handle_netsplit(&fabric, &peer_sid).await;
    result
}

/// Process one post-handshake message from a peer. Returns lines to send
/// back on this link.
async fn handle_peer_message(
    fabric: &Arc<Fabric>,
    peer_sid: &ServerId,
    hs: &mut LinkHandshake,
    msg: Message,
) -> Result<Vec<Message>, LinkError> {
    let mut replies = Vec::new();
    match msg.command.as_str() {
        "PING" => {
            let token = msg.arg(0).unwrap_or(fabric.server.name.as_str());
            replies.push(
                Message::pong(fabric.server.sid.as_str(), token)
                    .with_source(Source::Name(fabric.server.sid.as_str().to_string())),
            );
            if hs.phase == LinkPhase::Bursting {
                mark_linked(hs, peer_sid);
            }
        }
        "PONG" => {
            if hs.phase == LinkPhase::Bursting {
                mark_linked(hs, peer_sid);
            }
        }
        "SID" => {
            let (Some(name), Some(hop), Some(sid_raw)) =
                (msg.arg(0), msg.arg(1), msg.arg(2))
            else {
                return Err(LinkError::Malformed("SID"));
            };
            let sid = ServerId::parse(sid_raw).map_err(|_| LinkError::Malformed("SID"))?;
            let learned_from = msg
                .source
                .as_ref()
                .and_then(|s| ServerId::parse(s.name()).ok())
                .filter(|s| fabric.sync.topology.contains(s))
                .unwrap_or_else(|| peer_sid.clone());
            fabric.sync.topology.insert(LinkedServer {
                sid,
                name: name.to_string(),
                description: msg.arg(3).unwrap_or_default().to_string(),
                hopcount: hop.parse().unwrap_or(2),
                learned_from: Some(learned_from),
            });
            crate::metrics::LINKED_SERVERS.set(fabric.sync.topology.len() as i64);
            relay(fabric, peer_sid, &msg).await;
        }
        "UID" | "EUID" => {
            replies.extend(burst::apply_uid(fabric, &msg).await);
            relay(fabric, peer_sid, &msg).await;
        }
        "SJOIN" => {
            burst::apply_sjoin(fabric, &msg).await;
            relay(fabric, peer_sid, &msg).await;
        }
        "TMODE" => {
            burst::apply_tmode(fabric, &msg).await;
            relay(fabric, peer_sid, &msg).await;
        }
        "BMASK" => {
            burst::apply_bmask(fabric, &msg).await;
            relay(fabric, peer_sid, &msg).await;
        }
        "TB" => {
            burst::apply_tb(fabric, &msg).await;
            relay(fabric, peer_sid, &msg).await;
        }
        "NICK" => {
            handle_remote_nick(fabric, &msg, &mut replies).await;
            relay(fabric, peer_sid, &msg).await;
        }
        "AWAY" => {
            if let Some(uid) = source_uid(&msg) {
                if let Some(user_arc) = fabric.user_by_uid(&uid) {
                    user_arc.write().await.away = msg.arg(0).map(str::to_string);
                }
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "PART" => {
            if let (Some(uid), Some(chan)) = (source_uid(&msg), msg.arg(0)) {
                let folded = irc_to_lower(chan);
                if let Some(user_arc) = fabric.user_by_uid(&uid) {
                    let source = user_arc.read().await.source();
                    let mut params = vec![chan.to_string()];
                    if let Some(reason) = msg.arg(1) {
                        params.push(reason.to_string());
                    }
                    let line = Message::cmd("PART", params).with_source(source);
                    fabric.send_to_channel(&folded, line, Some(&uid)).await;
                }
                fabric.leave_channel(&uid, &folded).await;
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "KICK" => {
            if let (Some(chan), Some(target)) = (msg.arg(0), msg.arg(1)) {
                let folded = irc_to_lower(chan);
                let reason = msg.arg(2).unwrap_or("Kicked").to_string();
                let target_nick = match fabric.user_by_uid(target) {
                    Some(user_arc) => user_arc.read().await.nick.clone(),
                    None => target.to_string(),
                };
                let source = match source_uid(&msg).and_then(|u| fabric.user_by_uid(&u)) {
                    Some(user_arc) => user_arc.read().await.source(),
                    None => Source::Name(fabric.server.name.clone()),
                };
                let line = Message::cmd(
                    "KICK",
                    [folded.as_str(), target_nick.as_str(), reason.as_str()],
                )
                .with_source(source);
                fabric.send_to_channel(&folded, line, None).await;
                fabric.leave_channel(target, &folded).await;
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "QUIT" => {
            if let Some(uid) = source_uid(&msg) {
                if let Some(removed) = fabric.remove_user(&uid).await {
                    let reason = msg.arg(0).unwrap_or("Quit");
                    let quit = Message::cmd("QUIT", [reason]).with_source(removed.source);
                    for local in removed.audience {
                        fabric.send_to_uid(&local, quit.clone());
                    }
                }
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "KILL" => {
            if let Some(target) = msg.arg(0) {
                let reason = msg.arg(1).unwrap_or("Killed").to_string();
                if fabric.is_local(target) {
                    fabric.disconnect_user(target, &reason).await;
                } else if let Some(removed) = fabric.remove_user(target).await {
                    let quit = Message::cmd("QUIT", [reason.as_str()])
                        .with_source(removed.source);
                    for local in removed.audience {
                        fabric.send_to_uid(&local, quit.clone());
                    }
                }
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "PRIVMSG" | "NOTICE" => {
            handle_remote_message(fabric, peer_sid, &msg).await;
        }
        "INVITE" => {
            if let (Some(target), Some(chan)) = (msg.arg(0), msg.arg(1)) {
                let folded = irc_to_lower(chan);
                if let Some(chan_arc) = fabric.channel(&folded) {
                    chan_arc.write().await.invited.insert(target.to_string());
                }
                if fabric.is_local(target) {
                    let source = match source_uid(&msg).and_then(|u| fabric.user_by_uid(&u)) {
                        Some(user_arc) => user_arc.read().await.source(),
                        None => Source::Name(fabric.server.name.clone()),
                    };
                    let target_nick = match fabric.user_by_uid(target) {
                        Some(user_arc) => user_arc.read().await.nick.clone(),
                        None => target.to_string(),
                    };
                    fabric.send_to_uid(
                        target,
                        Message::cmd("INVITE", [target_nick.as_str(), chan])
                            .with_source(source),
                    );
                } else if let Ok(sid) = ServerId::parse(&target[..3]) {
                    fabric.sync.route(&sid, Arc::new(msg.clone())).await;
                }
            }
        }
        "WALLOPS" => {
            if let Some(text) = msg.arg(0) {
                let source = match source_uid(&msg).and_then(|u| fabric.user_by_uid(&u)) {
                    Some(user_arc) => user_arc.read().await.source(),
                    None => Source::Name(fabric.server.name.clone()),
                };
                let line = Message::cmd("WALLOPS", [text]).with_source(source);
                let user_arcs: Vec<(String, _)> = fabric
                    .users
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for (uid, user_arc) in user_arcs {
                    if fabric.is_local(&uid)
                        && user_arc.read().await.modes.has(UserModes::WALLOPS)
                    {
                        fabric.send_to_uid(&uid, line.clone());
                    }
                }
            }
            relay(fabric, peer_sid, &msg).await;
        }
        "SQUIT" => {
            if let Some(sid) = msg.arg(0).and_then(|s| ServerId::parse(s).ok()) {
                handle_netsplit(fabric, &sid).await;
            }
        }
        "ENCAP" => {
            debug!(target = ?msg.arg(0), "ENCAP ignored");
        }
        "ERROR" => {
            return Err(LinkError::PeerError(
                msg.arg(0).unwrap_or("no reason").to_string(),
            ));
        }
        other => {
            debug!(command = %other, "Unhandled S2S command");
        }
    }
    Ok(replies)
}

fn mark_linked(hs: &mut LinkHandshake, peer_sid: &ServerId) {
    hs.phase = LinkPhase::Linked;
    info!(peer = %peer_sid, "Burst complete, link synchronized");
}

fn source_uid(msg: &Message) -> Option<String> {
    match &msg.source {
        Some(Source::Name(name)) if name.len() == 9 => Some(name.clone()),
        _ => None,
    }
}

/// Flood a state-change message to every other peer (spanning tree).
async fn relay(fabric: &Arc<Fabric>, arrived_from: &ServerId, msg: &Message) {
    fabric
        .sync
        .broadcast(Arc::new(msg.clone()), Some(arrived_from))
        .await;
}

/// Nick change from a remote user, with collision handling: a rename onto
/// an occupied nick kills the renamer (we hold the older claim).
async fn handle_remote_nick(
    fabric: &Arc<Fabric>,
    msg: &Message,
    replies: &mut Vec<Message>,
) {
    let Some(uid) = source_uid(msg) else { return };
    let Some(new_nick) = msg.arg(0) else { return };
    let Ok(nickname) = lattice_proto::ident::Nickname::parse(new_nick) else {
        return;
    };
    match fabric.change_nick(&uid, &nickname).await {
        Ok((old_source, audience)) => {
            if let Some(ts) = msg.arg(1).and_then(|t| t.parse::<i64>().ok()) {
                if let Some(user_arc) = fabric.user_by_uid(&uid) {
                    user_arc.write().await.nick_ts = ts;
                }
            }
            let line = Message::cmd("NICK", [new_nick]).with_source(old_source);
            for local in audience {
                fabric.send_to_uid(&local, line.clone());
            }
        }
        Err(()) => {
            if let Some(removed) = fabric.remove_user(&uid).await {
                let quit =
                    Message::cmd("QUIT", ["Nick collision"]).with_source(removed.source);
                for local in removed.audience {
                    fabric.send_to_uid(&local, quit.clone());
                }
            }
            replies.push(
                Message::cmd("KILL", [uid.as_str(), "Nick collision"])
                    .with_source(Source::Name(fabric.server.sid.as_str().to_string())),
            );
        }
    }
}

/// PRIVMSG/NOTICE from a peer: deliver locally with the user-visible
/// source, and pass along toward any further recipients.
async fn handle_remote_message(fabric: &Arc<Fabric>, arrived_from: &ServerId, msg: &Message) {
    let (Some(target), Some(text)) = (msg.arg(0), msg.arg(1)) else {
        return;
    };
    let source = match source_uid(msg).and_then(|u| fabric.user_by_uid(&u)) {
        Some(user_arc) => user_arc.read().await.source(),
        None => match &msg.source {
            Some(source) => source.clone(),
            None => Source::Name(fabric.server.name.clone()),
        },
    };

    if lattice_proto::ident::ChannelName::is_channel_like(target) {
        let folded = irc_to_lower(target);
        let line = Message::cmd(msg.command.as_str(), [target, text]).with_source(source);
        fabric.send_to_channel(&folded, line, None).await;
        fabric
            .relay_to_channel_peers(&folded, msg.clone(), Some(arrived_from))
            .await;
    } else if fabric.is_local(target) {
        let line = Message::cmd(msg.command.as_str(), [target, text]).with_source(source);
        fabric.send_to_uid(target, line);
    } else if let Ok(sid) = ServerId::parse(target.get(..3).unwrap_or_default()) {
        fabric.sync.route(&sid, Arc::new(msg.clone())).await;
    }
}
