//! Template rendering over delivery events.
//!
//! Parameter values and HTTP bodies are `{{ expr }}` templates evaluated
//! against the event payload. The dialect is deliberately restricted:
//! field navigation (`a.b.c`), array indexing (`arr[0]`, `arr.first`,
//! `arr.last`), pipe filters (including `default` and `json`), and process
//! environment lookup under `env.<NAME>`. Logic tags are rejected so a
//! template can never loop or branch. Missing paths render to the empty
//! string.
//!
//! The evaluator is pure: (template, event, process env) → string. No other
//! I/O, no side effects.

use std::sync::Arc;

use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use minijinja::{Environment, UndefinedBehavior};

use crate::error::{Error, Result};
use crate::model::delivery::Event;

/// Render a single template against an event.
pub fn render(template: &str, event: &Event) -> Result<String> {
    if template.contains("{%") {
        return Err(Error::Template(
            "logic tags ({% ... %}) are not supported in action templates".into(),
        ));
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.add_filter("json", json_filter);
    env.add_filter("date", date_filter);

    let tmpl = env.template_from_str(template)?;
    let ctx = Value::from_object(RootContext {
        payload: event.payload.clone(),
    });
    Ok(tmpl.render(ctx)?)
}

/// Render every template of a parameter map, failing on the first error.
pub fn render_all(
    parameters: &std::collections::BTreeMap<String, String>,
    event: &Event,
) -> Result<std::collections::BTreeMap<String, String>> {
    parameters
        .iter()
        .map(|(name, template)| {
            render(template, event)
                .map(|value| (name.clone(), value))
                .map_err(|err| Error::Template(format!("parameter '{name}': {err}")))
        })
        .collect()
}

fn json_filter(value: Value) -> std::result::Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(|err| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, err.to_string())
    })
}

/// Reformat an RFC 3339 timestamp with a strftime pattern. Values that do
/// not parse pass through unchanged.
fn date_filter(value: String, format: String) -> String {
    chrono::DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.format(&format).to_string())
        .unwrap_or(value)
}

/// Template root: the event payload plus the `env` namespace.
#[derive(Debug)]
struct RootContext {
    payload: serde_json::Value,
}

impl Object for RootContext {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        if key == "env" {
            return Some(Value::from_object(EnvLookup));
        }
        self.payload.get(key).map(to_template_value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let mut keys: Vec<Value> = self
            .payload
            .as_object()
            .map(|map| map.keys().map(|k| Value::from(k.as_str())).collect())
            .unwrap_or_default();
        keys.push(Value::from("env"));
        Enumerator::Values(keys)
    }
}

/// Process environment lookup for `env.<NAME>`.
#[derive(Debug)]
struct EnvLookup;

impl Object for EnvLookup {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        std::env::var(key.as_str()?).ok().map(Value::from)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::NonEnumerable
    }
}

/// JSON object wrapper so nested arrays keep `.first`/`.last` navigation.
#[derive(Debug)]
struct JsonMap(serde_json::Map<String, serde_json::Value>);

impl Object for JsonMap {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        self.0.get(key.as_str()?).map(to_template_value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.0.keys().map(|k| Value::from(k.as_str())).collect())
    }
}

/// JSON array wrapper supporting `arr[0]`, negative indexes, `arr.first`,
/// and `arr.last`.
#[derive(Debug)]
struct JsonSeq(Vec<serde_json::Value>);

impl Object for JsonSeq {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Seq
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        if let Ok(idx) = i64::try_from(key.clone()) {
            let len = self.0.len() as i64;
            let idx = if idx < 0 { idx + len } else { idx };
            if idx < 0 || idx >= len {
                return None;
            }
            return Some(to_template_value(&self.0[idx as usize]));
        }
        match key.as_str()? {
            "first" => self.0.first().map(to_template_value),
            "last" => self.0.last().map(to_template_value),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Seq(self.0.len())
    }
}

fn to_template_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Object(map) => Value::from_object(JsonMap(map.clone())),
        serde_json::Value::Array(items) => Value::from_object(JsonSeq(items.clone())),
        other => Value::from_serialize(other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(payload: serde_json::Value) -> Event {
        Event::new("alert.created", payload)
    }

    #[test]
    fn renders_field_navigation() {
        let event = event(json!({"data": {"host": "prod-db-01"}}));
        assert_eq!(render("{{ data.host }}", &event).unwrap(), "prod-db-01");
    }

    #[test]
    fn missing_paths_render_empty() {
        let event = event(json!({"data": {}}));
        assert_eq!(render("{{ data.nope.deeper }}", &event).unwrap(), "");
        assert_eq!(render("{{ completely.absent }}", &event).unwrap(), "");
    }

    #[test]
    fn array_indexing_and_first_last() {
        let event = event(json!({"hosts": ["a", "b", "c"]}));
        assert_eq!(render("{{ hosts[0] }}", &event).unwrap(), "a");
        assert_eq!(render("{{ hosts[-1] }}", &event).unwrap(), "c");
        assert_eq!(render("{{ hosts.first }}", &event).unwrap(), "a");
        assert_eq!(render("{{ hosts.last }}", &event).unwrap(), "c");
    }

    #[test]
    fn nested_arrays_keep_navigation() {
        let event = event(json!({"incident": {"services": [{"name": "db"}]}}));
        assert_eq!(
            render("{{ incident.services.first.name }}", &event).unwrap(),
            "db"
        );
    }

    #[test]
    fn default_filter_covers_missing() {
        let event = event(json!({}));
        assert_eq!(
            render("{{ severity | default('low') }}", &event).unwrap(),
            "low"
        );
    }

    #[test]
    fn json_filter_serializes_subtrees() {
        let event = event(json!({"data": {"host": "db", "port": 5432}}));
        let out = render("{{ data | json }}", &event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!({"host": "db", "port": 5432}));
    }

    #[test]
    fn date_filter_reformats() {
        let event = event(json!({"created_at": "2026-03-04T10:30:00Z"}));
        assert_eq!(
            render("{{ created_at | date('%Y-%m-%d') }}", &event).unwrap(),
            "2026-03-04"
        );
    }

    #[test]
    fn env_lookup() {
        let event = event(json!({}));
        temp_env::with_var("REC_TEST_REGION", Some("eu-west-1"), || {
            assert_eq!(
                render("{{ env.REC_TEST_REGION }}", &event).unwrap(),
                "eu-west-1"
            );
        });
    }

    #[test]
    fn logic_tags_rejected() {
        let event = event(json!({}));
        let err = render("{% for x in hosts %}{{ x }}{% endfor %}", &event).unwrap_err();
        assert!(err.to_string().contains("logic tags"));
    }

    #[test]
    fn numbers_render_as_strings() {
        let event = event(json!({"count": 7}));
        assert_eq!(render("{{ count }}", &event).unwrap(), "7");
    }

    #[test]
    fn render_all_names_the_failing_parameter() {
        let mut params = std::collections::BTreeMap::new();
        params.insert("bad".to_string(), "{{ unclosed".to_string());
        let err = render_all(&params, &event(json!({}))).unwrap_err();
        assert!(err.to_string().contains("parameter 'bad'"));
    }
}
