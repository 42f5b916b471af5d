//! Operator commands: OPER, KILL, WALLOPS, KLINE/UNKLINE, REHASH, DIE,
//! RESTART.
//!
//! OPER itself gates on the configured oper blocks; everything else gates
//! on +o via the dispatcher, plus the per-block privilege bits.

use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::security::{BanKind, ServerBan};
use crate::state::OperPrivileges;
use async_trait::async_trait;
use lattice_proto::message::Source;
use lattice_proto::{Message, Response, UserModes};

pub struct OperHandler;

#[async_trait]
impl Handler for OperHandler {
    fn min_params(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let name = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let password = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?.to_string();

        let config = ctx.fabric.config();
        let Some(block) = config.opers.iter().find(|o| o.name == name) else {
            ctx.numeric(Response::ERR_NOOPERHOST, ["No O-lines for your host"]);
            return Ok(());
        };

        let mask = ctx
            .fabric
            .hostmask_of(ctx.uid)
            .await
            .ok_or(HandlerError::NotRegistered)?;
        if !mask.matches(&block.mask) {
            ctx.numeric(Response::ERR_NOOPERHOST, ["No O-lines for your host"]);
            return Ok(());
        }
        if !crate::db::verify_argon2(&block.password_hash, &password) {
            tracing::warn!(nick = %ctx.nick(), oper = %name, "Failed OPER attempt");
            ctx.numeric(Response::ERR_PASSWDMISMATCH, ["Password incorrect"]);
            return Ok(());
        }

        let privileges = OperPrivileges::from_names(&block.privileges);
        {
            let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;
            let mut user = user_arc.write().await;
            user.modes.set(UserModes::OPER, true);
            user.privileges = privileges;
        }
        crate::metrics::OPERATORS_ONLINE.inc();
        ctx.numeric(Response::RPL_YOUREOPER, ["You are now an IRC operator"]);
        let nick = ctx.nick().to_string();
        ctx.reply(
            Message::cmd("MODE", [nick.as_str(), "+o"]).with_source(Source::Name(nick.clone())),
        );
        tracing::info!(nick = %nick, oper = %name, "Operator authenticated");
        Ok(())
    }
}

/// Check one privilege bit, replying 481 when absent.
async fn require_privilege(ctx: &mut Context<'_>, bit: u32) -> Result<bool, HandlerError> {
    let user_arc = ctx.user().ok_or(HandlerError::NotRegistered)?;
    let allowed = user_arc.read().await.privileges.has(bit);
    if !allowed {
        ctx.numeric(
            Response::ERR_NOPRIVILEGES,
            ["Permission Denied- You're not an IRC operator"],
        );
    }
    Ok(allowed)
}

pub struct KillHandler;

#[async_trait]
impl Handler for KillHandler {
    fn min_params(&self) -> usize {
        2
    }

    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::KILL).await? {
            return Ok(());
        }
        let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let reason = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?.to_string();

        let Some(target_uid) = ctx.fabric.uid_by_nick(&target) else {
            ctx.numeric(Response::ERR_NOSUCHNICK, [target.as_str(), "No such nick/channel"]);
            return Ok(());
        };

        let full_reason = format!("Killed ({} ({}))", ctx.nick(), reason);
        if ctx.fabric.is_local(&target_uid) {
            ctx.fabric.disconnect_user(&target_uid, &full_reason).await;
        } else {
            // Route the KILL toward the hosting server; its QUIT comes back.
            if let Ok(sid) = lattice_proto::ident::ServerId::parse(&target_uid[..3]) {
                let kill = Message::cmd("KILL", [target_uid.as_str(), full_reason.as_str()])
                    .with_source(Source::Name(ctx.uid.to_string()));
                ctx.fabric.sync.route(&sid, std::sync::Arc::new(kill)).await;
            }
        }
        tracing::info!(by = %ctx.nick(), target = %target, reason = %reason, "KILL");
        Ok(())
    }
}

pub struct WallopsHandler;

#[async_trait]
impl Handler for WallopsHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::WALLOPS).await? {
            return Ok(());
        }
        let text = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let (nick, username, host) = ctx
            .source_parts()
            .await
            .ok_or(HandlerError::NotRegistered)?;
        let line = Message::cmd("WALLOPS", [text.as_str()]).with_source(Source::User {
            nick,
            user: username,
            host,
        });

        // Every local user with +w.
        let user_arcs: Vec<(String, _)> = ctx
            .fabric
            .users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (uid, user_arc) in user_arcs {
            if !ctx.fabric.is_local(&uid) {
                continue;
            }
            if user_arc.read().await.modes.has(UserModes::WALLOPS) {
                ctx.fabric.send_to_uid(&uid, line.clone());
            }
        }

        ctx.fabric
            .broadcast_network(
                Message::cmd("WALLOPS", [text.as_str()])
                    .with_source(Source::Name(ctx.uid.to_string())),
                None,
            )
            .await;
        Ok(())
    }
}

pub struct KlineHandler;

#[async_trait]
impl Handler for KlineHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::KLINE).await? {
            return Ok(());
        }

        // KLINE [duration] <user@host> [:reason]
        let mut idx = 0;
        let duration = msg
            .arg(0)
            .and_then(|a| a.parse::<i64>().ok())
            .inspect(|_| idx = 1);
        let Some(pattern) = msg.arg(idx) else {
            return Err(HandlerError::NeedMoreParams);
        };
        let reason = msg
            .arg(idx + 1)
            .unwrap_or("No reason given")
            .to_string();

        let now = chrono::Utc::now().timestamp();
        let ban = ServerBan {
            kind: BanKind::KLine,
            pattern: pattern.to_string(),
            reason: reason.clone(),
            set_by: ctx.nick().to_string(),
            created_at: now,
            expires_at: duration.map(|minutes| now + minutes * 60),
        };
        ctx.fabric.bans.insert(ban.clone());
        if let Err(e) = ctx.fabric.db.save_server_ban(&ban).await {
            tracing::warn!(error = %e, "Failed to persist K-line");
        }

        // Disconnect every local user the new ban matches.
        let affected = matching_local_users(ctx, &ban).await;
        for uid in affected {
            ctx.fabric
                .disconnect_user(&uid, &format!("K-lined: {}", reason))
                .await;
        }

        let nick = ctx.nick().to_string();
        ctx.reply(
            Message::notice(&nick, &format!("Added K-line for {}", ban.pattern))
                .from_server(&ctx.fabric.server.name),
        );
        tracing::info!(by = %nick, pattern = %ban.pattern, "K-line added");
        Ok(())
    }
}

async fn matching_local_users(ctx: &Context<'_>, ban: &ServerBan) -> Vec<String> {
    let now = chrono::Utc::now().timestamp();
    let table = crate::security::BanTable::new();
    table.insert(ban.clone());

    let mut affected = Vec::new();
    let user_arcs: Vec<(String, _)> = ctx
        .fabric
        .users
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    for (uid, user_arc) in user_arcs {
        if !ctx.fabric.is_local(&uid) {
            continue;
        }
        let user = user_arc.read().await;
        if user.is_oper() {
            continue;
        }
        let Ok(ip) = user.ip.parse() else { continue };
        if table.check(&user.user, &user.host, ip, now).is_some() {
            affected.push(uid.clone());
        }
    }
    affected
}

pub struct UnklineHandler;

#[async_trait]
impl Handler for UnklineHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::KLINE).await? {
            return Ok(());
        }
        let pattern = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
        let removed = ctx.fabric.bans.remove(BanKind::KLine, &pattern);
        if let Err(e) = ctx.fabric.db.delete_server_ban(BanKind::KLine, &pattern).await {
            tracing::warn!(error = %e, "Failed to delete K-line");
        }
        let nick = ctx.nick().to_string();
        let text = if removed {
            format!("Removed K-line for {}", pattern)
        } else {
            format!("No K-line for {}", pattern)
        };
        ctx.reply(Message::notice(&nick, &text).from_server(&ctx.fabric.server.name));
        Ok(())
    }
}

pub struct RehashHandler;

#[async_trait]
impl Handler for RehashHandler {
    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::REHASH).await? {
            return Ok(());
        }
        let path = ctx.fabric.config_path();
        ctx.numeric(Response::RPL_REHASHING, [path.as_str(), "Rehashing"]);

        match crate::config::Config::load(&path) {
            Ok(config) => match crate::config::validate(&config) {
                Ok(()) => {
                    ctx.fabric.replace_config(std::sync::Arc::new(config));
                    tracing::info!(by = %ctx.nick(), path = %path, "Configuration rehashed");
                }
                Err(errors) => {
                    for error in &errors {
                        tracing::error!(error = %error, "Rehash validation failed");
                    }
                    let nick = ctx.nick().to_string();
                    ctx.reply(
                        Message::notice(&nick, "Rehash failed: configuration invalid")
                            .from_server(&ctx.fabric.server.name),
                    );
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Rehash load failed");
                let nick = ctx.nick().to_string();
                ctx.reply(
                    Message::notice(&nick, "Rehash failed: cannot load configuration")
                        .from_server(&ctx.fabric.server.name),
                );
            }
        }
        Ok(())
    }
}

pub struct DieHandler;

#[async_trait]
impl Handler for DieHandler {
    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::DIE).await? {
            return Ok(());
        }
        tracing::warn!(by = %ctx.nick(), "DIE - shutting down");
        let _ = ctx.fabric.shutdown.send(());
        Ok(())
    }
}

pub struct RestartHandler;

#[async_trait]
impl Handler for RestartHandler {
    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        if !require_privilege(ctx, OperPrivileges::DIE).await? {
            return Ok(());
        }
        tracing::warn!(by = %ctx.nick(), "RESTART - shutting down for restart");
        let _ = ctx.fabric.shutdown.send(());
        Ok(())
    }
}
