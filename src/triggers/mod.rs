//! Trigger engine: pattern rules evaluated against user events.
//!
//! Triggers are configured declaratively (`[[triggers]]`) and evaluated in
//! priority order against a per-event context. Conditions combine under
//! AND/OR; matching rules emit actions (reply, notice, kick, mode) which
//! the caller applies through the ordinary command paths — the engine
//! itself never mutates the graph. Regex conditions run on the `regex`
//! crate, whose engine is linear-time, so per-message CPU is bounded.

use crate::config::{ActionConfig, ConditionConfig, TriggerConfig};
use dashmap::DashMap;
use lattice_proto::ident::wildcard_match;
use lattice_proto::irc_to_lower;
use regex::Regex;
use std::time::{Duration, Instant};

/// Event classes triggers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Message,
    Join,
    Part,
    Nick,
    Command,
}

impl TriggerEvent {
    fn name(self) -> &'static str {
        match self {
            TriggerEvent::Message => "message",
            TriggerEvent::Join => "join",
            TriggerEvent::Part => "part",
            TriggerEvent::Nick => "nick",
            TriggerEvent::Command => "command",
        }
    }
}

/// The facts a trigger can condition on.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext<'a> {
    pub nick: &'a str,
    pub hostmask: &'a str,
    pub channel: Option<&'a str>,
    pub message: &'a str,
    pub account: Option<&'a str>,
    pub registered: bool,
    pub operator: bool,
    /// Command name for `command` events.
    pub command: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CooldownScope {
    Global,
    Channel,
    User,
    UserChannel,
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Wildcard(String),
    Contains(String),
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Command(String),
    Always,
}

#[derive(Debug)]
struct Condition {
    matcher: Matcher,
    field: String,
    negate: bool,
}

/// An action to be applied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    Reply(String),
    Notice(String),
    Kick(String),
    Mode(String),
}

struct Trigger {
    id: String,
    enabled: bool,
    priority: i32,
    events: Vec<TriggerEvent>,
    conditions: Vec<Condition>,
    combinator: Combinator,
    actions: Vec<TriggerAction>,
    cooldown: Duration,
    scope: CooldownScope,
    stop_on_match: bool,
}

/// The engine: compiled triggers plus cooldown bookkeeping.
pub struct TriggerEngine {
    triggers: Vec<Trigger>,
    /// (trigger id, scope key) → last fire, on a monotonic clock.
    last_fired: DashMap<(String, String), Instant>,
}

impl TriggerEngine {
    /// Compile configured triggers. Invalid entries were rejected by
    /// config validation; anything that still fails here is skipped with
    /// a warning rather than taking the server down.
    pub fn from_config(configs: &[TriggerConfig]) -> Self {
        let mut triggers: Vec<Trigger> = configs
            .iter()
            .filter_map(|c| match compile(c) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!(trigger = %c.id, error = %e, "Skipping bad trigger");
                    None
                }
            })
            .collect();
        triggers.sort_by_key(|t| t.priority);
        Self {
            triggers,
            last_fired: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Evaluate an event. Returns the actions of every matching trigger in
    /// priority order, stopping after a `stop_on_match` rule.
    pub fn evaluate(&self, event: TriggerEvent, ctx: &TriggerContext<'_>) -> Vec<TriggerAction> {
        self.evaluate_at(event, ctx, Instant::now())
    }

    /// Evaluation with an injected clock, for tests.
    pub fn evaluate_at(
        &self,
        event: TriggerEvent,
        ctx: &TriggerContext<'_>,
        now: Instant,
    ) -> Vec<TriggerAction> {
        let mut out = Vec::new();
        for trigger in &self.triggers {
            if !trigger.enabled || !trigger.events.contains(&event) {
                continue;
            }
            if !matches(trigger, ctx) {
                continue;
            }
            if self.on_cooldown(trigger, ctx, now) {
                crate::metrics::TRIGGER_COOLDOWN_BLOCKED.inc();
                continue;
            }
            out.extend(trigger.actions.iter().cloned());
            if trigger.stop_on_match {
                break;
            }
        }
        out
    }

    fn on_cooldown(&self, trigger: &Trigger, ctx: &TriggerContext<'_>, now: Instant) -> bool {
        if trigger.cooldown.is_zero() {
            return false;
        }
        let key = (trigger.id.clone(), scope_key(trigger.scope, ctx));
        let blocked = match self.last_fired.get(&key) {
            Some(last) => now.duration_since(*last) < trigger.cooldown,
            None => false,
        };
        if blocked {
            true
        } else {
            self.last_fired.insert(key, now);
            false
        }
    }
}

fn scope_key(scope: CooldownScope, ctx: &TriggerContext<'_>) -> String {
    match scope {
        CooldownScope::Global => String::new(),
        CooldownScope::Channel => irc_to_lower(ctx.channel.unwrap_or("")),
        CooldownScope::User => irc_to_lower(ctx.nick),
        CooldownScope::UserChannel => format!(
            "{}\u{0}{}",
            irc_to_lower(ctx.nick),
            irc_to_lower(ctx.channel.unwrap_or(""))
        ),
    }
}

fn matches(trigger: &Trigger, ctx: &TriggerContext<'_>) -> bool {
    if trigger.conditions.is_empty() {
        return true;
    }
    let mut iter = trigger.conditions.iter().map(|c| check(c, ctx));
    match trigger.combinator {
        Combinator::And => iter.all(|x| x),
        Combinator::Or => iter.any(|x| x),
    }
}

fn check(cond: &Condition, ctx: &TriggerContext<'_>) -> bool {
    let field = match cond.field.as_str() {
        "nick" => ctx.nick,
        "hostmask" => ctx.hostmask,
        "channel" => ctx.channel.unwrap_or(""),
        "account" => ctx.account.unwrap_or(""),
        _ => ctx.message,
    };
    let hit = match &cond.matcher {
        Matcher::Regex(re) => re.is_match(field),
        Matcher::Wildcard(pat) => wildcard_match(&irc_to_lower(field), &irc_to_lower(pat)),
        Matcher::Contains(s) => field.contains(s.as_str()),
        Matcher::Equals(s) => field == s,
        Matcher::StartsWith(s) => field.starts_with(s.as_str()),
        Matcher::EndsWith(s) => field.ends_with(s.as_str()),
        Matcher::Command(s) => ctx
            .command
            .is_some_and(|c| c.eq_ignore_ascii_case(s)),
        Matcher::Always => true,
    };
    hit != cond.negate
}

fn compile(config: &TriggerConfig) -> Result<Trigger, String> {
    let events = config
        .events
        .iter()
        .map(|e| {
            [
                TriggerEvent::Message,
                TriggerEvent::Join,
                TriggerEvent::Part,
                TriggerEvent::Nick,
                TriggerEvent::Command,
            ]
            .into_iter()
            .find(|ev| ev.name() == e)
            .ok_or_else(|| format!("unknown event {:?}", e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let conditions = config
        .conditions
        .iter()
        .map(|c| {
            let matcher = match c.kind.as_str() {
                "regex" => Matcher::Regex(
                    Regex::new(&c.value).map_err(|e| format!("bad regex: {}", e))?,
                ),
                "wildcard" => Matcher::Wildcard(c.value.clone()),
                "contains" => Matcher::Contains(c.value.clone()),
                "equals" => Matcher::Equals(c.value.clone()),
                "starts_with" => Matcher::StartsWith(c.value.clone()),
                "ends_with" => Matcher::EndsWith(c.value.clone()),
                "command" => Matcher::Command(c.value.clone()),
                "always" => Matcher::Always,
                other => return Err(format!("unknown condition kind {:?}", other)),
            };
            Ok(Condition {
                matcher,
                field: c.field.clone(),
                negate: c.negate,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    let actions = config
        .actions
        .iter()
        .map(|a: &ActionConfig| match a.kind.as_str() {
            "reply" => Ok(TriggerAction::Reply(a.value.clone())),
            "notice" => Ok(TriggerAction::Notice(a.value.clone())),
            "kick" => Ok(TriggerAction::Kick(a.value.clone())),
            "mode" => Ok(TriggerAction::Mode(a.value.clone())),
            other => Err(format!("unknown action kind {:?}", other)),
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(Trigger {
        id: config.id.clone(),
        enabled: config.enabled,
        priority: config.priority,
        events,
        conditions,
        combinator: if config.combinator == "or" {
            Combinator::Or
        } else {
            Combinator::And
        },
        actions,
        cooldown: Duration::from_secs(config.cooldown_seconds),
        scope: match config.cooldown_scope.as_str() {
            "channel" => CooldownScope::Channel,
            "user" => CooldownScope::User,
            "user_channel" => CooldownScope::UserChannel,
            _ => CooldownScope::Global,
        },
        stop_on_match: config.stop_on_match,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionConfig, ConditionConfig, TriggerConfig};

    fn trigger_config(id: &str) -> TriggerConfig {
        TriggerConfig {
            id: id.to_string(),
            enabled: true,
            priority: 0,
            events: vec!["message".to_string()],
            conditions: vec![],
            combinator: "and".to_string(),
            actions: vec![ActionConfig {
                kind: "reply".to_string(),
                value: "hi".to_string(),
            }],
            cooldown_seconds: 0,
            cooldown_scope: "global".to_string(),
            stop_on_match: false,
        }
    }

    fn cond(kind: &str, field: &str, value: &str) -> ConditionConfig {
        ConditionConfig {
            kind: kind.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            negate: false,
        }
    }

    fn msg_ctx<'a>(message: &'a str, nick: &'a str) -> TriggerContext<'a> {
        TriggerContext {
            nick,
            hostmask: "x!y@z",
            channel: Some("#lobby"),
            message,
            account: None,
            registered: false,
            operator: false,
            command: None,
        }
    }

    #[test]
    fn condition_kinds_match() {
        let mut config = trigger_config("t1");
        config.conditions = vec![
            cond("contains", "message", "help"),
            cond("wildcard", "nick", "al*"),
        ];
        let engine = TriggerEngine::from_config(&[config]);

        let actions = engine.evaluate(TriggerEvent::Message, &msg_ctx("need help", "alice"));
        assert_eq!(actions, vec![TriggerAction::Reply("hi".to_string())]);

        // AND: one condition failing suppresses the trigger.
        assert!(engine
            .evaluate(TriggerEvent::Message, &msg_ctx("need help", "bob"))
            .is_empty());
    }

    #[test]
    fn or_combinator() {
        let mut config = trigger_config("t2");
        config.combinator = "or".to_string();
        config.conditions = vec![
            cond("equals", "message", "ping"),
            cond("equals", "message", "pong"),
        ];
        let engine = TriggerEngine::from_config(&[config]);
        assert!(!engine
            .evaluate(TriggerEvent::Message, &msg_ctx("pong", "a"))
            .is_empty());
        assert!(engine
            .evaluate(TriggerEvent::Message, &msg_ctx("peng", "a"))
            .is_empty());
    }

    #[test]
    fn priority_and_stop_on_match() {
        let mut first = trigger_config("first");
        first.priority = 1;
        first.stop_on_match = true;
        first.actions = vec![ActionConfig {
            kind: "notice".to_string(),
            value: "first".to_string(),
        }];
        let mut second = trigger_config("second");
        second.priority = 2;
        second.actions = vec![ActionConfig {
            kind: "notice".to_string(),
            value: "second".to_string(),
        }];
        // Registered out of order; priority decides.
        let engine = TriggerEngine::from_config(&[second, first]);
        let actions = engine.evaluate(TriggerEvent::Message, &msg_ctx("x", "a"));
        assert_eq!(actions, vec![TriggerAction::Notice("first".to_string())]);
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let mut config = trigger_config("cd");
        config.cooldown_seconds = 60;
        config.cooldown_scope = "user".to_string();
        let engine = TriggerEngine::from_config(&[config]);

        let t0 = Instant::now();
        assert!(!engine
            .evaluate_at(TriggerEvent::Message, &msg_ctx("x", "alice"), t0)
            .is_empty());
        // Same user, inside the window: blocked.
        assert!(engine
            .evaluate_at(TriggerEvent::Message, &msg_ctx("x", "alice"), t0)
            .is_empty());
        // Different user: separate scope key.
        assert!(!engine
            .evaluate_at(TriggerEvent::Message, &msg_ctx("x", "bob"), t0)
            .is_empty());
        // After the window: fires again.
        assert!(!engine
            .evaluate_at(
                TriggerEvent::Message,
                &msg_ctx("x", "alice"),
                t0 + Duration::from_secs(61)
            )
            .is_empty());
    }

    #[test]
    fn disabled_and_wrong_event_ignored() {
        let mut config = trigger_config("off");
        config.enabled = false;
        let engine = TriggerEngine::from_config(&[config]);
        assert!(engine
            .evaluate(TriggerEvent::Message, &msg_ctx("x", "a"))
            .is_empty());

        let engine = TriggerEngine::from_config(&[trigger_config("msg-only")]);
        assert!(engine
            .evaluate(TriggerEvent::Join, &msg_ctx("x", "a"))
            .is_empty());
    }

    #[test]
    fn negated_condition() {
        let mut config = trigger_config("neg");
        config.conditions = vec![ConditionConfig {
            kind: "starts_with".to_string(),
            field: "message".to_string(),
            value: "!".to_string(),
            negate: true,
        }];
        let engine = TriggerEngine::from_config(&[config]);
        assert!(!engine
            .evaluate(TriggerEvent::Message, &msg_ctx("hello", "a"))
            .is_empty());
        assert!(engine
            .evaluate(TriggerEvent::Message, &msg_ctx("!cmd", "a"))
            .is_empty());
    }
}
