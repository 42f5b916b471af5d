//! Server information queries: MOTD, LUSERS, VERSION, TIME, ADMIN, INFO,
//! STATS.

use super::connection::send_motd;
use super::context::Context;
use super::Handler;
use crate::error::HandlerResult;
use async_trait::async_trait;
use lattice_proto::{Message, Response};

pub struct MotdHandler;

#[async_trait]
impl Handler for MotdHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        send_motd(ctx);
        Ok(())
    }
}

pub struct LusersHandler;

#[async_trait]
impl Handler for LusersHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let snapshot = ctx.fabric.snapshot().await;
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
                ctx.fabric.sync.peers.len()
            )],
        );
        Ok(())
    }
}

pub struct VersionHandler;

#[async_trait]
impl Handler for VersionHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let server = ctx.server_name().to_string();
        ctx.numeric(
            Response::RPL_VERSION,
            [
                concat!("latticed-", env!("CARGO_PKG_VERSION")).to_string(),
                server,
                "TS6".to_string(),
            ],
        );
        Ok(())
    }
}

pub struct TimeHandler;

#[async_trait]
impl Handler for TimeHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let server = ctx.server_name().to_string();
        ctx.numeric(
            Response::RPL_TIME,
            [
                server,
                chrono::Utc::now()
                    .format("%A %B %d %Y -- %H:%M:%S UTC")
                    .to_string(),
            ],
        );
        Ok(())
    }
}

pub struct AdminHandler;

#[async_trait]
impl Handler for AdminHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let server = ctx.server_name().to_string();
        let admin_name = ctx.fabric.server.admin_name.clone();
        let admin_email = ctx.fabric.server.admin_email.clone();
        ctx.numeric(
            Response::RPL_ADMINME,
            [server, "Administrative info".to_string()],
        );
        ctx.numeric(
            Response::RPL_ADMINLOC1,
            [ctx.fabric.server.description.clone()],
        );
        ctx.numeric(Response::RPL_ADMINLOC2, [admin_name]);
        ctx.numeric(Response::RPL_ADMINEMAIL, [admin_email]);
        Ok(())
    }
}

pub struct InfoHandler;

#[async_trait]
impl Handler for InfoHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let lines = [
            concat!("latticed ", env!("CARGO_PKG_VERSION")).to_string(),
            "A TS6-style federated IRC server".to_string(),
            format!(
                "Online since {}",
                ctx.fabric.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ];
        for line in lines {
            ctx.numeric(Response::RPL_INFO, [line]);
        }
        ctx.numeric(Response::RPL_ENDOFINFO, ["End of /INFO list"]);
        Ok(())
    }
}

pub struct StatsHandler;

#[async_trait]
impl Handler for StatsHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_oper(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let query = msg.arg(0).unwrap_or("").chars().next().unwrap_or('?');
        match query {
            'u' => {
                let uptime = chrono::Utc::now() - ctx.fabric.started_at;
                let secs = uptime.num_seconds();
                ctx.numeric(
                    Response::RPL_STATSUPTIME,
                    [format!(
                        "Server Up {} days, {:02}:{:02}:{:02}",
                        secs / 86_400,
                        (secs / 3_600) % 24,
                        (secs / 60) % 60,
                        secs % 60
                    )],
                );
            }
            'o' => {
                for oper in &ctx.fabric.config().opers {
                    ctx.numeric(
                        Response::RPL_STATSOLINE,
                        [
                            "O".to_string(),
                            oper.mask.clone(),
                            "*".to_string(),
                            oper.name.clone(),
                        ],
                    );
                }
            }
            'k' => {
                for ban in ctx.fabric.bans.of_kind(crate::security::BanKind::KLine) {
                    ctx.numeric(
                        Response::RPL_STATSKLINE,
                        [
                            "K".to_string(),
                            ban.pattern.clone(),
                            ban.reason.clone(),
                        ],
                    );
                }
            }
            'm' => {
                for (command, count) in ctx.registry.command_stats() {
                    ctx.numeric(
                        Response::RPL_STATSCOMMANDS,
                        [command.to_string(), count.to_string()],
                    );
                }
            }
            _ => {}
        }
        ctx.numeric(
            Response::RPL_ENDOFSTATS,
            [query.to_string(), "End of /STATS report".to_string()],
        );
        Ok(())
    }
}
