//! Per-connection task: registration phase, unified event loop, timers.
//!
//! One task per client connection. Inbound lines are parsed by the codec
//! and dispatched in order; the next command is not read until the
//! previous handler returns, so per-connection ordering holds by
//! construction. Outbound traffic from the broker drains through the
//! bounded send queue. Timers cover the registration deadline and the
//! PING/PONG liveness probe.

use crate::broker::labeled_batch;
use crate::error::HandlerError;
use crate::handlers::{Context, Registry};
use crate::state::{ClientHandle, Fabric, Session};
use futures_util::{SinkExt, StreamExt};
use lattice_proto::error::ParseError;
use lattice_proto::{LineCodec, Message};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const PING_CHECK_SECS: u64 = 15;

pub async fn run(
    fabric: Arc<Fabric>,
    registry: Arc<Registry>,
    stream: TcpStream,
    addr: SocketAddr,
    secure: bool,
) {
    let uid = fabric.uid_gen.allocate();
    let config = fabric.config();

    let (tx, rx) = mpsc::channel::<Arc<Message>>(config.limits.sendq_lines);
    fabric.senders.insert(
        uid.clone(),
        ClientHandle {
            tx,
            caps: Arc::new(parking_lot::RwLock::new(HashSet::new())),
            secure,
        },
    );

    info!(uid = %uid, addr = %addr, secure, "Connection accepted");

    let mut session = Session::new(secure, None);
    let framed = Framed::new(stream, LineCodec::new());
    let quit_reason = event_loop(
        &fabric,
        &registry,
        framed,
        rx,
        &uid,
        addr,
        &mut session,
        &config,
    )
    .await;

    if session.registered && fabric.users.contains_key(&uid) {
        let reason = quit_reason.as_deref().unwrap_or("Client Quit");
        fabric.disconnect_user(&uid, reason).await;
    } else {
        // Never registered: no graph presence beyond a possible nick claim.
        fabric.senders.remove(&uid);
        if let Some(nick) = &session.nick {
            fabric.release_nick(&lattice_proto::irc_to_lower(nick), &uid);
        }
        fabric.rate_limiter.forget_connection(&uid);
        info!(uid = %uid, "Unregistered connection closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    fabric: &Arc<Fabric>,
    registry: &Arc<Registry>,
    mut framed: Framed<TcpStream, LineCodec>,
    mut rx: mpsc::Receiver<Arc<Message>>,
    uid: &str,
    addr: SocketAddr,
    session: &mut Session,
    config: &crate::config::Config,
) -> Option<String> {
    let mut shutdown_rx = fabric.shutdown.subscribe();
    let registration_deadline =
        tokio::time::sleep(Duration::from_secs(config.limits.registration_timeout));
    tokio::pin!(registration_deadline);
    let mut ping_timer = tokio::time::interval(Duration::from_secs(PING_CHECK_SECS));
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await;

    let ping_interval = Duration::from_secs(config.limits.ping_interval);
    let ping_timeout = Duration::from_secs(config.limits.ping_timeout);

    loop {
        tokio::select! {
            () = &mut registration_deadline, if !session.registered => {
                let _ = framed
                    .send(&Message::irc_error("Registration timeout"))
                    .await;
                return Some("Registration timeout".to_string());
            }

            item = framed.next() => {
                match item {
                    None => return None,
                    Some(Err(e)) => {
                        debug!(uid = %uid, error = %e, "Read error");
                        return None;
                    }
                    Some(Ok(Err(parse_err))) => {
                        if handle_parse_error(&mut framed, session, fabric, parse_err).await {
                            return Some("Input line too long".to_string());
                        }
                    }
                    Some(Ok(Ok(msg))) => {
                        session.last_activity = Instant::now();
                        session.ping_pending = false;
                        session.ping_sent_at = None;

                        match process(fabric, registry, &mut framed, uid, addr, session, msg).await {
                            Flow::Continue => {}
                            Flow::Quit(reason) => return reason,
                        }

                        // The graph may have removed us (KILL, collision).
                        if session.registered && !fabric.users.contains_key(uid) {
                            return None;
                        }
                    }
                }
            }

            out = rx.recv() => {
                let Some(out) = out else {
                    // Handle dropped: the graph already removed us.
                    return None;
                };
                if framed.send(&*out).await.is_err() {
                    return None;
                }
                // The broker only emits ERROR when tearing the session down.
                if out.command == "ERROR" {
                    return None;
                }
            }

            _ = ping_timer.tick() => {
                if let Some(timeout_msg) =
                    check_liveness(&mut framed, fabric, session, ping_interval, ping_timeout).await
                {
                    return Some(timeout_msg);
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = framed
                    .send(&Message::irc_error("Server shutting down"))
                    .await;
                return Some("Server shutting down".to_string());
            }
        }
    }
}

enum Flow {
    Continue,
    Quit(Option<String>),
}

async fn process(
    fabric: &Arc<Fabric>,
    registry: &Arc<Registry>,
    framed: &mut Framed<TcpStream, LineCodec>,
    uid: &str,
    addr: SocketAddr,
    session: &mut Session,
    msg: Message,
) -> Flow {
    let label = if session.has_cap("labeled-response") {
        msg.tag("label").map(str::to_string)
    } else {
        None
    };

    let mut ctx = Context::new(uid, fabric, session, addr, label.clone(), registry);
    let result = registry.dispatch(&mut ctx, &msg).await;
    let replies = std::mem::take(&mut ctx.replies);
    drop(ctx);

    // Touch the idle clock on the graph entity too.
    if session.registered {
        if let Some(user_arc) = fabric.user_by_uid(uid) {
            user_arc.write().await.last_activity = chrono::Utc::now().timestamp();
        }
    }

    let out = match label {
        Some(label) if session.has_cap("batch") => {
            labeled_batch(&fabric.server.name, &label, replies)
        }
        Some(label) => replies
            .into_iter()
            .map(|m| m.with_tag("label", Some(&label)))
            .collect(),
        None => replies,
    };
    for reply in &out {
        if framed.send(reply).await.is_err() {
            return Flow::Quit(None);
        }
    }

    match result {
        Ok(()) => Flow::Continue,
        Err(HandlerError::Quit(reason)) => {
            let text = reason.clone().unwrap_or_else(|| "Client Quit".to_string());
            let _ = framed
                .send(&Message::irc_error(&format!("Closing Link: {}", text)))
                .await;
            Flow::Quit(Some(text))
        }
        Err(HandlerError::AccessDenied) => Flow::Quit(Some("Excess Flood".to_string())),
        Err(HandlerError::RateLimited) => Flow::Continue,
        Err(HandlerError::Send(_)) => Flow::Quit(None),
        Err(other) => {
            // Dispatcher translated everything else already; anything left
            // is logged and survives.
            warn!(uid = %uid, error = %other, "Unhandled handler error");
            Flow::Continue
        }
    }
}

/// Returns true when the connection must close (oversized input).
async fn handle_parse_error(
    framed: &mut Framed<TcpStream, LineCodec>,
    session: &Session,
    fabric: &Arc<Fabric>,
    err: ParseError,
) -> bool {
    match err {
        ParseError::LineTooLong(_) | ParseError::TagsTooLong(_) => {
            let nick = session.nick.as_deref().unwrap_or("*");
            let reply = Message::cmd(
                &lattice_proto::Response::ERR_INPUTTOOLONG.as_command(),
                [nick, "Input line was too long"],
            )
            .from_server(&fabric.server.name);
            let _ = framed.send(&reply).await;
            let _ = framed
                .send(&Message::irc_error("Input line too long"))
                .await;
            true
        }
        other => {
            debug!(error = %other, "Dropping malformed line");
            let _ = framed.send(&Message::irc_error("Invalid input")).await;
            false
        }
    }
}

/// Drive the PING liveness probe. Returns the quit message on timeout.
async fn check_liveness(
    framed: &mut Framed<TcpStream, LineCodec>,
    fabric: &Arc<Fabric>,
    session: &mut Session,
    ping_interval: Duration,
    ping_timeout: Duration,
) -> Option<String> {
    if !session.registered {
        return None;
    }
    let idle = session.last_activity.elapsed();
    if session.ping_pending {
        if session
            .ping_sent_at
            .is_some_and(|sent| sent.elapsed() >= ping_timeout)
        {
            let text = format!("Ping timeout: {} seconds", idle.as_secs());
            let _ = framed
                .send(&Message::irc_error(&format!("Closing Link: {}", text)))
                .await;
            return Some(text);
        }
    } else if idle >= ping_interval {
        let ping = Message::ping(&fabric.server.name);
        if framed.send(&ping).await.is_err() {
            return Some("Write error".to_string());
        }
        session.ping_pending = true;
        session.ping_sent_at = Some(Instant::now());
    }
    None
}
