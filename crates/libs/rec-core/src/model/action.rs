use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How an action executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Script,
    Http,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Script => "script",
            ActionKind::Http => "http",
        }
    }
}

/// Where a script action's file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Local,
    Git,
}

/// Outbound request description for http-kind actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template, rendered against the event before sending.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Git checkout options for git-sourced script actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitOptions {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Minimum seconds between pulls of this repository.
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
}

/// Value type of a declared callable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    List,
}

/// A declared input of a callable action, surfaced to the control plane at
/// registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Allowed values; only meaningful for `list` parameters.
    #[serde(default)]
    pub options: Vec<String>,
}

impl ParameterDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidAction("parameter without a name".into()));
        }
        if !self.options.is_empty() && self.param_type != ParamType::List {
            return Err(Error::InvalidAction(format!(
                "parameter '{}': options are only valid for list parameters",
                self.name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for option in &self.options {
            if !seen.insert(option) {
                return Err(Error::InvalidAction(format!(
                    "parameter '{}': duplicate option '{}'",
                    self.name, option
                )));
            }
        }
        if self.param_type == ParamType::List {
            if let Some(default) = self.default.as_ref().and_then(serde_json::Value::as_str) {
                if !self.options.iter().any(|o| o == default) {
                    return Err(Error::InvalidAction(format!(
                        "parameter '{}': default '{}' is not one of the options",
                        self.name, default
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An agent-local executable unit bound to an event trigger.
///
/// Automatic actions trigger on a domain event type; callable actions are
/// invoked by an `*.action_triggered` / `action.triggered` event whose slug
/// equals the action id. The table of actions is immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unique id; the slug matched against explicit-invocation events.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ActionKind,
    /// Event type this action triggers on.
    pub trigger_event_type: String,
    #[serde(default)]
    pub source: SourceType,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub http: Option<HttpSpec>,
    /// Parameter name → template expression.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub parameter_definitions: Vec<ParameterDefinition>,
    pub timeout_seconds: u64,
    /// Extra environment for script children, on top of the global env.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub git_options: Option<GitOptions>,
}

impl Action {
    /// Display name: explicit name when set, id otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Structural invariants: exactly one body, a non-empty trigger, a
    /// positive timeout, and coherent source options.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidAction("action without an id".into()));
        }
        if self.trigger_event_type.is_empty() {
            return Err(Error::InvalidAction(format!(
                "action '{}': trigger event type is empty",
                self.id
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidAction(format!(
                "action '{}': timeout must be > 0",
                self.id
            )));
        }
        match (self.kind, &self.script_path, &self.http) {
            (ActionKind::Script, Some(_), None) => {}
            (ActionKind::Http, None, Some(_)) => {}
            _ => {
                return Err(Error::InvalidAction(format!(
                    "action '{}': exactly one of script or http must be set",
                    self.id
                )));
            }
        }
        if self.source == SourceType::Git && self.git_options.is_none() {
            return Err(Error::InvalidAction(format!(
                "action '{}': git source requires git_options",
                self.id
            )));
        }
        for def in &self.parameter_definitions {
            def.validate()?;
        }
        Ok(())
    }
}
