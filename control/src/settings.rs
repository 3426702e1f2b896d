//! The fixed registry of per-project settings the agent container
//! understands. Each setting maps to one environment variable in the
//! project's config map; unknown keys are rejected at the API boundary.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingType {
    String,
    Int,
    Float,
    Bool,
    Enum(&'static [&'static str]),
}

pub struct SettingDef {
    pub key: &'static str,
    pub env: &'static str,
    pub ty: SettingType,
    /// Textual default, coerced through `coerce` on use. `None` means the
    /// variable is omitted when the project has no explicit value.
    pub default: Option<&'static str>,
    pub requires_restart: bool,
}

pub const REGISTRY: &[SettingDef] = &[
    SettingDef {
        key: "model",
        env: "AGENT_MODEL",
        ty: SettingType::String,
        default: None,
        requires_restart: true,
    },
    SettingDef {
        key: "provider",
        env: "AGENT_PROVIDER",
        ty: SettingType::Enum(&["openai", "anthropic", "google", "ollama"]),
        default: Some("openai"),
        requires_restart: true,
    },
    SettingDef {
        key: "temperature",
        env: "AGENT_TEMPERATURE",
        ty: SettingType::Float,
        default: Some("0.7"),
        requires_restart: true,
    },
    SettingDef {
        key: "max_turns",
        env: "AGENT_MAX_TURNS",
        ty: SettingType::Int,
        default: Some("25"),
        requires_restart: true,
    },
    SettingDef {
        key: "tool_timeout_secs",
        env: "AGENT_TOOL_TIMEOUT_SECS",
        ty: SettingType::Int,
        default: Some("120"),
        requires_restart: true,
    },
    SettingDef {
        key: "debug_logging",
        env: "AGENT_DEBUG_LOGGING",
        ty: SettingType::Bool,
        default: Some("false"),
        requires_restart: false,
    },
    SettingDef {
        key: "session_retention_days",
        env: "AGENT_SESSION_RETENTION_DAYS",
        ty: SettingType::Int,
        default: Some("30"),
        requires_restart: false,
    },
];

pub fn lookup(key: &str) -> Option<&'static SettingDef> {
    REGISTRY.iter().find(|def| def.key == key)
}

/// Coerce a JSON value to the declared type of a setting. Accepts both the
/// native JSON type and a string rendering of it, so `PUT {"value": "25"}`
/// and `PUT {"value": 25}` are equivalent for an int setting.
pub fn coerce(def: &SettingDef, value: &Value) -> Result<Value, String> {
    match def.ty {
        SettingType::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(format!(
                "setting '{}' expects a string, got {}",
                def.key, other
            )),
        },
        SettingType::Int => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("setting '{}' expects an integer, got '{}'", def.key, s)),
            other => Err(format!(
                "setting '{}' expects an integer, got {}",
                def.key, other
            )),
        },
        SettingType::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(|f| serde_json::json!(f))
                .ok_or_else(|| format!("setting '{}' expects a number", def.key)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| serde_json::json!(f))
                .map_err(|_| format!("setting '{}' expects a number, got '{}'", def.key, s)),
            other => Err(format!(
                "setting '{}' expects a number, got {}",
                def.key, other
            )),
        },
        SettingType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!(
                    "setting '{}' expects a boolean, got '{}'",
                    def.key, s
                )),
            },
            other => Err(format!(
                "setting '{}' expects a boolean, got {}",
                def.key, other
            )),
        },
        SettingType::Enum(variants) => match value {
            Value::String(s) if variants.contains(&s.as_str()) => Ok(value.clone()),
            Value::String(s) => Err(format!(
                "setting '{}' must be one of {:?}, got '{}'",
                def.key, variants, s
            )),
            other => Err(format!(
                "setting '{}' expects a string, got {}",
                def.key, other
            )),
        },
    }
}

impl SettingDef {
    /// The coerced default value, if the setting declares one.
    pub fn default_value(&self) -> Option<Value> {
        let text = self.default?;
        // Registry defaults are well-formed by construction; coerce from the
        // string rendering like any user-provided value.
        coerce(self, &Value::String(text.to_string())).ok()
    }

    /// Render a coerced value as the environment variable string.
    pub fn env_string(&self, value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(lookup("model").is_some());
        assert!(lookup("no_such_setting").is_none());
    }

    #[test]
    fn int_coercion_accepts_string_and_number() {
        let def = lookup("max_turns").unwrap();
        assert_eq!(coerce(def, &json!(30)).unwrap(), json!(30));
        assert_eq!(coerce(def, &json!("30")).unwrap(), json!(30));
        assert!(coerce(def, &json!("thirty")).is_err());
        assert!(coerce(def, &json!(1.5)).is_err());
    }

    #[test]
    fn float_coercion() {
        let def = lookup("temperature").unwrap();
        assert_eq!(coerce(def, &json!(0.2)).unwrap(), json!(0.2));
        assert_eq!(coerce(def, &json!("0.2")).unwrap(), json!(0.2));
        assert!(coerce(def, &json!(true)).is_err());
    }

    #[test]
    fn bool_coercion() {
        let def = lookup("debug_logging").unwrap();
        assert_eq!(coerce(def, &json!(true)).unwrap(), json!(true));
        assert_eq!(coerce(def, &json!("False")).unwrap(), json!(false));
        assert!(coerce(def, &json!(1)).is_err());
    }

    #[test]
    fn enum_rejects_unknown_variant() {
        let def = lookup("provider").unwrap();
        assert_eq!(coerce(def, &json!("anthropic")).unwrap(), json!("anthropic"));
        assert!(coerce(def, &json!("bedrock")).is_err());
    }

    #[test]
    fn defaults_parse_under_their_own_type() {
        for def in REGISTRY {
            if def.default.is_some() {
                assert!(
                    def.default_value().is_some(),
                    "default for '{}' does not coerce",
                    def.key
                );
            }
        }
    }

    #[test]
    fn env_string_renders_without_json_quotes() {
        let def = lookup("provider").unwrap();
        assert_eq!(def.env_string(&json!("openai")), "openai");
        let def = lookup("max_turns").unwrap();
        assert_eq!(def.env_string(&json!(25)), "25");
    }
}
