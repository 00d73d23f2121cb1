use serde::{Deserialize, Serialize};

use crate::marks::Schema;

const DEFAULT_MAX_NORMALIZE_ITERATIONS: usize = 100;
const DEFAULT_STYLE: &str = "normal";
const DEFAULT_KEY_PREFIX: &str = "k";

fn default_decorators() -> Vec<String> {
    ["strong", "em", "code", "underline", "strike-through"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Mark names treated as decorators. Everything else is an annotation key.
    pub decorators: Vec<String>,
    /// Upper bound on corrective passes per batch. `0` selects the default.
    pub max_normalize_iterations: usize,
    pub default_style: String,
    /// Prefix for generated annotation keys.
    pub key_prefix: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            decorators: default_decorators(),
            max_normalize_iterations: DEFAULT_MAX_NORMALIZE_ITERATIONS,
            default_style: DEFAULT_STYLE.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl EditorConfig {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = DEFAULT_MAX_NORMALIZE_ITERATIONS;
        }
        if self.default_style.is_empty() {
            self.default_style = DEFAULT_STYLE.to_string();
        }
        if self.key_prefix.is_empty() {
            self.key_prefix = DEFAULT_KEY_PREFIX.to_string();
        }
        self
    }

    pub fn schema(&self) -> Schema {
        Schema::new(self.decorators.iter().cloned())
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(s).map(Self::with_defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EditorConfig::from_json_str(r#"{ "decorators": ["strong"], "max_normalize_iterations": 0 }"#)
                .unwrap();
        assert_eq!(config.decorators, vec!["strong".to_string()]);
        assert_eq!(config.max_normalize_iterations, 100);
        assert_eq!(config.default_style, "normal");
        assert!(config.schema().is_decorator("strong"));
        assert!(!config.schema().is_decorator("em"));
    }
}
