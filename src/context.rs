//! Deploy environment assembly and template rendering.
//!
//! Every command and path template in the pipeline is rendered against an
//! `EnvContext`: an insertion-ordered key/value namespace seeded with
//! `SPUG_*` identity variables and layered with resolved configuration,
//! variant-specific keys and per-host keys. Later layers override earlier
//! ones with identical keys.

use crate::error::{DeployError, Result};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvContext {
    entries: Vec<(String, String)>,
}

impl EnvContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or override. An existing key keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn merge<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in pairs {
            self.set(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.entries {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(map)
    }

    /// Substitute `{{ KEY }}` references. An unresolved variable is a
    /// `TemplateError`; no expression evaluation is performed.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry
            .render_template(template, &self.to_json())
            .map_err(|e| DeployError::Template(format!("{template:?}: {e}")))
    }

    /// Substitution for optional fields: unresolved variables render empty.
    pub fn render_or_empty(&self, template: &str) -> String {
        let registry = Handlebars::new();
        registry
            .render_template(template, &self.to_json())
            .unwrap_or_default()
    }
}

/// Parse configuration text of `key = value` lines. Blank lines and lines
/// starting with `#` or `;` are skipped; a line without `=` or with an empty
/// key fails, naming the line.
pub fn parse_config_text(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            DeployError::Validation(format!(
                "failed to parse {line:?}, expected key = value format"
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(DeployError::Validation(format!(
                "failed to parse {line:?}, expected key = value format"
            )));
        }
        pairs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_override_in_place() {
        let mut env = EnvContext::new();
        env.set("SPUG_APP_NAME", "web");
        env.set("SPUG_ENV_KEY", "prod");
        env.set("SPUG_APP_NAME", "api");
        assert_eq!(env.get("SPUG_APP_NAME"), Some("api"));
        let keys: Vec<_> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["SPUG_APP_NAME", "SPUG_ENV_KEY"]);
    }

    #[test]
    fn render_substitutes_variables() {
        let mut env = EnvContext::new();
        env.set("SPUG_ENV_KEY", "prod");
        env.set("SPUG_APP_KEY", "web");
        let out = env.render("/data/{{SPUG_ENV_KEY}}/{{SPUG_APP_KEY}}").unwrap();
        assert_eq!(out, "/data/prod/web");
    }

    #[test]
    fn render_fails_on_unresolved_variable() {
        let env = EnvContext::new();
        let err = env.render("{{SPUG_MISSING}}").unwrap_err();
        assert!(matches!(err, DeployError::Template(_)));
    }

    #[test]
    fn render_or_empty_substitutes_missing_as_empty() {
        let mut env = EnvContext::new();
        env.set("SPUG_IMAGE_NAME", "api");
        assert_eq!(env.render_or_empty("{{SPUG_IMAGE_NAME}}:{{SPUG_MISSING}}"), "api:");
    }

    #[test]
    fn config_text_parses_key_value_pairs() {
        let pairs = parse_config_text("_SPUG_FOO = bar").unwrap();
        assert_eq!(pairs, vec![("_SPUG_FOO".to_string(), "bar".to_string())]);
    }

    #[test]
    fn config_text_skips_comments_and_blanks() {
        let text = "# comment\n; also comment\n\n_SPUG_A=1\n_SPUG_B = 2 ";
        let pairs = parse_config_text(text).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("_SPUG_A".to_string(), "1".to_string()),
                ("_SPUG_B".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn config_text_error_names_the_line() {
        let err = parse_config_text("_SPUG_A=1\nnot a pair").unwrap_err();
        assert!(err.to_string().contains("not a pair"));
    }
}
