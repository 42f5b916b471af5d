//! IRCv3 capability negotiation and SASL.

use super::connection::try_complete_registration;
use super::context::Context;
use super::Handler;
use crate::error::{HandlerError, HandlerResult};
use crate::state::SaslPhase;
use async_trait::async_trait;
use lattice_proto::caps::{Capability, SERVER_CAPABILITIES};
use lattice_proto::sasl::{ChunkBuffer, PlainCredentials};
use lattice_proto::{Message, Response};

/// Mechanisms this server offers. EXTERNAL additionally requires a secure
/// transport with a client certificate.
const SASL_MECHANISMS: &[&str] = &["PLAIN", "EXTERNAL"];

pub struct CapHandler;

#[async_trait]
impl Handler for CapHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let sub = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_ascii_uppercase();
        match sub.as_str() {
            "LS" => {
                if let Some(version) = msg.arg(1).and_then(|v| v.parse::<u32>().ok()) {
                    ctx.session.cap_version = ctx.session.cap_version.max(version);
                }
                if !ctx.session.registered {
                    ctx.session.cap_negotiating = true;
                }
                let list = ls_tokens(ctx.session.cap_version >= 302);
                let nick = ctx.nick().to_string();
                ctx.reply(
                    Message::cmd("CAP", [nick.as_str(), "LS", list.as_str()])
                        .from_server(&ctx.fabric.server.name),
                );
            }
            "LIST" => {
                let mut enabled: Vec<&str> =
                    ctx.session.caps.iter().map(String::as_str).collect();
                enabled.sort_unstable();
                let list = enabled.join(" ");
                let nick = ctx.nick().to_string();
                ctx.reply(
                    Message::cmd("CAP", [nick.as_str(), "LIST", list.as_str()])
                        .from_server(&ctx.fabric.server.name),
                );
            }
            "REQ" => {
                let requested = msg.arg(1).unwrap_or_default().to_string();
                if !ctx.session.registered {
                    ctx.session.cap_negotiating = true;
                }
                handle_req(ctx, &requested);
            }
            "END" => {
                ctx.session.cap_negotiating = false;
                try_complete_registration(ctx).await?;
            }
            _ => {
                ctx.numeric(
                    Response::ERR_UNKNOWNCOMMAND,
                    [format!("CAP {}", sub), "Unknown CAP subcommand".to_string()],
                );
            }
        }
        Ok(())
    }
}

/// `CAP REQ` is atomic: every requested capability must be known, or the
/// whole set is refused with NAK and nothing changes.
fn handle_req(ctx: &mut Context<'_>, requested: &str) {
    let nick = ctx.nick().to_string();
    let mut grants: Vec<(String, bool)> = Vec::new();
    let mut all_known = true;

    for token in requested.split_whitespace() {
        let (name, disable) = match token.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (token, false),
        };
        if Capability::from_str_opt(name).is_none() {
            all_known = false;
            break;
        }
        grants.push((name.to_string(), disable));
    }

    let verb = if all_known && !grants.is_empty() {
        for (name, disable) in &grants {
            if *disable {
                ctx.session.caps.remove(name);
            } else {
                ctx.session.caps.insert(name.clone());
            }
        }
        // Keep the fan-out mirror in step for already-registered clients.
        if let Some(handle) = ctx.fabric.senders.get(ctx.uid) {
            *handle.caps.write() = ctx.session.caps.clone();
        }
        "ACK"
    } else {
        "NAK"
    };
    ctx.reply(
        Message::cmd("CAP", [nick.as_str(), verb, requested])
            .from_server(&ctx.fabric.server.name),
    );
}

fn ls_tokens(v302: bool) -> String {
    SERVER_CAPABILITIES
        .iter()
        .map(|cap| match cap.ls_value(SASL_MECHANISMS) {
            Some(value) if v302 => format!("{}={}", cap.as_str(), value),
            _ => cap.as_str().to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct AuthenticateHandler;

#[async_trait]
impl Handler for AuthenticateHandler {
    fn min_params(&self) -> usize {
        1
    }

    fn needs_registration(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let arg = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();

        if ctx.session.registered {
            ctx.numeric(
                Response::ERR_SASLALREADY,
                ["You have already authenticated using SASL"],
            );
            return Ok(());
        }

        if arg == "*" {
            ctx.session.sasl = SaslPhase::Idle;
            ctx.numeric(Response::ERR_SASLABORTED, ["SASL authentication aborted"]);
            return Ok(());
        }

        match std::mem::take(&mut ctx.session.sasl) {
            SaslPhase::Idle => start_mechanism(ctx, &arg),
            SaslPhase::AwaitingPayload { mechanism, mut buffer } => {
                consume_chunk(ctx, mechanism, &mut buffer, &arg).await?
            }
        }
        Ok(())
    }
}

fn start_mechanism(ctx: &mut Context<'_>, mechanism: &str) {
    let mechanism = mechanism.to_ascii_uppercase();
    let supported = SASL_MECHANISMS.contains(&mechanism.as_str());
    let tls_ok = mechanism != "EXTERNAL" || ctx.session.secure;

    if !supported || !tls_ok {
        ctx.numeric(
            Response::RPL_SASLMECHS,
            [SASL_MECHANISMS.join(","), "are available SASL mechanisms".to_string()],
        );
        ctx.numeric(Response::ERR_SASLFAIL, ["SASL authentication failed"]);
        return;
    }

    ctx.session.sasl = SaslPhase::AwaitingPayload {
        mechanism,
        buffer: ChunkBuffer::default(),
    };
    ctx.reply(Message::cmd("AUTHENTICATE", ["+"]));
}

async fn consume_chunk(
    ctx: &mut Context<'_>,
    mechanism: String,
    buffer: &mut ChunkBuffer,
    chunk: &str,
) -> HandlerResult {
    let payload = match buffer.push(chunk) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            // More chunks expected; restore the in-flight state.
            ctx.session.sasl = SaslPhase::AwaitingPayload {
                mechanism,
                buffer: std::mem::take(buffer),
            };
            return Ok(());
        }
        Err(lattice_proto::sasl::SaslError::ChunkTooLong) => {
            ctx.numeric(Response::ERR_SASLTOOLONG, ["SASL message too long"]);
            return Ok(());
        }
        Err(_) => {
            ctx.numeric(Response::ERR_SASLFAIL, ["SASL authentication failed"]);
            return Ok(());
        }
    };

    let outcome = match mechanism.as_str() {
        "PLAIN" => authenticate_plain(ctx, &payload).await,
        "EXTERNAL" => authenticate_external(ctx, &payload).await,
        _ => None,
    };

    match outcome {
        Some(account) => {
            ctx.session.account = Some(account.clone());
            let nick = ctx.nick().to_string();
            let user = ctx.session.user.clone().unwrap_or_else(|| "*".to_string());
            let mask = format!("{}!{}@{}", nick, user, ctx.addr.ip());
            ctx.numeric(
                Response::RPL_LOGGEDIN,
                [
                    mask,
                    account.clone(),
                    format!("You are now logged in as {}", account),
                ],
            );
            ctx.numeric(Response::RPL_SASLSUCCESS, ["SASL authentication successful"]);
            try_complete_registration(ctx).await?;
        }
        None => {
            ctx.numeric(Response::ERR_SASLFAIL, ["SASL authentication failed"]);
        }
    }
    Ok(())
}

/// PLAIN: `[authzid] \0 authcid \0 password`, verified against the account
/// store. A present authzid selects the account to bind.
async fn authenticate_plain(ctx: &Context<'_>, payload: &[u8]) -> Option<String> {
    let creds = PlainCredentials::parse(payload).ok()?;
    let verified = ctx
        .fabric
        .db
        .verify_password(&creds.authcid, &creds.password)
        .await
        .unwrap_or(false);
    if !verified {
        return None;
    }
    Some(creds.authzid.unwrap_or(creds.authcid))
}

/// EXTERNAL: bind to the account holding the session's certificate
/// fingerprint; an explicit authzid must match it.
async fn authenticate_external(ctx: &Context<'_>, payload: &[u8]) -> Option<String> {
    let fingerprint = ctx.session.certfp.as_deref()?;
    let account = ctx
        .fabric
        .db
        .find_account_by_fingerprint(fingerprint)
        .await
        .ok()??;
    if account.suspended {
        return None;
    }
    if !payload.is_empty() {
        let authzid = std::str::from_utf8(payload).ok()?;
        if !authzid.eq_ignore_ascii_case(&account.name) {
            return None;
        }
    }
    Some(account.name)
}
