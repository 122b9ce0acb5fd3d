//! Actions file loading.
//!
//! The actions file is YAML with three top-level sections:
//!
//! ```yaml
//! defaults:
//!   timeout: 30
//!   source_type: local
//!
//! on:                          # automatic actions, keyed by event type
//!   alert.created:
//!     script: ./scripts/handle_alert.sh
//!     parameters:
//!       host: "{{ data.host }}"
//!   incident.created:          # a list is accepted for multiple actions
//!     - name: page_oncall
//!       http:
//!         url: https://hooks.example.com/page
//!         body: '{"title": "{{ title }}"}'
//!
//! callable:                    # explicit-invocation actions, keyed by slug
//!   restart_service:
//!     script: ./scripts/restart.sh
//!     parameter_definitions:
//!       - name: service
//!         type: string
//!         required: true
//! ```
//!
//! Loading validates every invariant the runtime depends on; any violation
//! is fatal at startup. The resulting catalog is immutable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::action::{
    Action, ActionKind, GitOptions, HttpSpec, ParameterDefinition, SourceType,
};
use crate::model::delivery::is_explicit_invocation_type;

/// Trigger assigned to callable actions.
const CALLABLE_TRIGGER: &str = "action.triggered";

/// Per-action timeout when neither the action nor defaults set one.
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// The validated, immutable set of configured actions.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    actions: Vec<Arc<Action>>,
}

impl ActionCatalog {
    /// Load and validate the actions file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate an actions document.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let file: RawActionsFile = serde_yaml::from_str(source)?;
        let defaults = file.defaults.unwrap_or_default();

        let mut actions = Vec::new();
        for (event_type, entry) in file.on {
            match entry {
                OneOrMany::One(raw) => {
                    let id = raw.name.clone().unwrap_or_else(|| event_type.clone());
                    actions.push(raw.into_action(id, event_type.clone(), &defaults)?);
                }
                OneOrMany::Many(list) => {
                    for raw in list {
                        let id = raw.name.clone().ok_or_else(|| {
                            Error::InvalidAction(format!(
                                "actions listed under '{event_type}' must each carry a name"
                            ))
                        })?;
                        actions.push(raw.into_action(id, event_type.clone(), &defaults)?);
                    }
                }
            }
        }
        for (slug, raw) in file.callable {
            actions.push(raw.into_action(slug, CALLABLE_TRIGGER.to_string(), &defaults)?);
        }

        let catalog = Self {
            actions: actions.into_iter().map(Arc::new).collect(),
        };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for action in &self.actions {
            action.validate()?;
            if !ids.insert(action.id.as_str()) {
                return Err(Error::DuplicateAction(action.id.clone()));
            }
            // Ids that are not event-type keys must stay dot-free so a slug
            // can never be confused with an event type.
            if action.id != action.trigger_event_type && action.id.contains('.') {
                return Err(Error::InvalidAction(format!(
                    "action '{}': ids must not contain dots",
                    action.id
                )));
            }
        }
        Ok(())
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    /// Actions triggered by domain events.
    pub fn automatic(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.actions
            .iter()
            .filter(|a| !is_explicit_invocation_type(&a.trigger_event_type))
    }

    /// Actions invoked explicitly by slug.
    pub fn callable(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.actions
            .iter()
            .filter(|a| is_explicit_invocation_type(&a.trigger_event_type))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Git options of every git-sourced action, for checkout at startup.
    pub fn git_sources(&self) -> impl Iterator<Item = &GitOptions> {
        self.actions
            .iter()
            .filter_map(|a| (a.source == SourceType::Git).then_some(a.git_options.as_ref()?))
    }
}

// -- Raw file schema

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawActionsFile {
    #[serde(default)]
    defaults: Option<RawDefaults>,
    #[serde(default)]
    on: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    callable: BTreeMap<String, RawAction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    timeout: Option<u64>,
    source_type: Option<SourceType>,
    git_options: Option<GitOptions>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(RawAction),
    Many(Vec<RawAction>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default)]
    http: Option<HttpSpec>,
    #[serde(default)]
    source_type: Option<SourceType>,
    #[serde(default)]
    git_options: Option<GitOptions>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    #[serde(default)]
    parameter_definitions: Vec<ParameterDefinition>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl RawAction {
    fn into_action(self, id: String, trigger: String, defaults: &RawDefaults) -> Result<Action> {
        let kind = match (&self.script, &self.http) {
            (Some(_), None) => ActionKind::Script,
            (None, Some(_)) => ActionKind::Http,
            _ => {
                return Err(Error::InvalidAction(format!(
                    "action '{id}': exactly one of script or http must be set"
                )));
            }
        };

        let mut env = defaults.env.clone();
        env.extend(self.env);

        let mut parameters = self.parameters;
        // Declared parameters without an explicit template pass the control
        // plane's value straight through.
        for def in &self.parameter_definitions {
            parameters
                .entry(def.name.clone())
                .or_insert_with(|| format!("{{{{ parameters.{} }}}}", def.name));
        }

        let action = Action {
            id,
            name: self.name,
            kind,
            trigger_event_type: trigger,
            source: self.source_type.or(defaults.source_type).unwrap_or_default(),
            script_path: self.script,
            http: self.http,
            parameters,
            parameter_definitions: self.parameter_definitions,
            timeout_seconds: self
                .timeout
                .or(defaults.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            env,
            git_options: self.git_options.or_else(|| defaults.git_options.clone()),
        };
        Ok(action)
    }
}
