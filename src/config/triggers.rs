//! Trigger rule configuration (`[[triggers]]` blocks).

use serde::Deserialize;

/// One pattern-rule trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower numbers run first.
    #[serde(default)]
    pub priority: i32,
    /// Event names: `message`, `join`, `part`, `nick`, `command`.
    pub events: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    /// `and` (default) or `or`.
    #[serde(default = "default_combinator")]
    pub combinator: String,
    pub actions: Vec<ActionConfig>,
    /// Seconds between firings within the cooldown scope.
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// `global`, `channel`, `user`, or `user_channel`.
    #[serde(default = "default_scope")]
    pub cooldown_scope: String,
    #[serde(default)]
    pub stop_on_match: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    /// `regex`, `wildcard`, `contains`, `equals`, `starts_with`,
    /// `ends_with`, `command`, `always`.
    pub kind: String,
    /// What to match against: `message` (default), `nick`, `hostmask`,
    /// `channel`, `account`.
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    /// `reply`, `notice`, `kick`, `mode`.
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

fn default_true() -> bool {
    true
}

fn default_combinator() -> String {
    "and".to_string()
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_field() -> String {
    "message".to_string()
}

impl TriggerConfig {
    /// Structural validation, run from config `validate`.
    pub fn check(&self) -> Result<(), String> {
        if self.events.is_empty() {
            return Err("no events listed".to_string());
        }
        if self.actions.is_empty() {
            return Err("no actions listed".to_string());
        }
        if !matches!(self.combinator.as_str(), "and" | "or") {
            return Err(format!("unknown combinator {:?}", self.combinator));
        }
        if !matches!(
            self.cooldown_scope.as_str(),
            "global" | "channel" | "user" | "user_channel"
        ) {
            return Err(format!("unknown cooldown scope {:?}", self.cooldown_scope));
        }
        for cond in &self.conditions {
            if cond.kind == "regex" {
                regex::Regex::new(&cond.value)
                    .map_err(|e| format!("bad regex {:?}: {}", cond.value, e))?;
            }
        }
        Ok(())
    }
}
