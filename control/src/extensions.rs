//! Extension records attached to a project. The enabled subset is handed to
//! the agent as a single multi-line environment variable with a canonical
//! rendering, so identical inputs always produce an identical config map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

/// Kind-specific payload. Exhaustive by design: adding a kind means
/// handling it everywhere the compiler points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionKind {
    Builtin,
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Sse {
        uri: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    StreamableHttp {
        uri: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Frontend,
    InlinePython {
        code: String,
    },
}

impl ExtensionKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ExtensionKind::Builtin => "builtin",
            ExtensionKind::Stdio { .. } => "stdio",
            ExtensionKind::Sse { .. } => "sse",
            ExtensionKind::StreamableHttp { .. } => "streamable_http",
            ExtensionKind::Frontend => "frontend",
            ExtensionKind::InlinePython { .. } => "inline_python",
        }
    }
}

/// Canonical rendering of the enabled extensions for the agent container.
///
/// Insertion order of the list is preserved; object keys are stable (struct
/// field order plus BTreeMap-sorted env maps), so the output is
/// deterministic for a given extension list.
pub fn render_env(extensions: &[Extension]) -> String {
    let enabled: Vec<&Extension> = extensions.iter().filter(|e| e.enabled).collect();
    // Vec<&Extension> serializes identically to the filtered list itself.
    serde_json::to_string_pretty(&enabled).unwrap_or_else(|_| "[]".to_string())
}

/// Validates an extension before it is stored. Names become identities for
/// idempotent add/remove, so they must be non-empty and unambiguous.
pub fn validate(ext: &Extension) -> Result<(), String> {
    if ext.name.trim().is_empty() {
        return Err("extension name must not be empty".to_string());
    }
    match &ext.kind {
        ExtensionKind::Stdio { command, .. } if command.trim().is_empty() => {
            Err(format!("extension '{}': stdio command must not be empty", ext.name))
        }
        ExtensionKind::Sse { uri, .. } | ExtensionKind::StreamableHttp { uri, .. }
            if uri.trim().is_empty() =>
        {
            Err(format!("extension '{}': uri must not be empty", ext.name))
        }
        ExtensionKind::InlinePython { code } if code.trim().is_empty() => {
            Err(format!("extension '{}': code must not be empty", ext.name))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(name: &str, enabled: bool) -> Extension {
        Extension {
            name: name.to_string(),
            enabled,
            kind: ExtensionKind::Stdio {
                command: "uvx".to_string(),
                args: vec!["server".to_string()],
                env: BTreeMap::from([("B".to_string(), "2".to_string()),
                                     ("A".to_string(), "1".to_string())]),
            },
        }
    }

    #[test]
    fn kind_tags_round_trip() {
        let ext = stdio("files", true);
        let json = serde_json::to_value(&ext).unwrap();
        assert_eq!(json["kind"], "stdio");
        let back: Extension = serde_json::from_value(json).unwrap();
        assert_eq!(back, ext);
    }

    #[test]
    fn render_skips_disabled_and_preserves_order() {
        let exts = vec![stdio("b", true), stdio("a", false), stdio("c", true)];
        let rendered = render_env(&exts);
        let parsed: Vec<Extension> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(
            parsed.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn render_is_deterministic() {
        let exts = vec![stdio("x", true)];
        assert_eq!(render_env(&exts), render_env(&exts.clone()));
        // env maps sort their keys regardless of insertion order
        assert!(render_env(&exts).find("\"A\"").unwrap() < render_env(&exts).find("\"B\"").unwrap());
    }

    #[test]
    fn validation_rejects_empty_payloads() {
        assert!(validate(&stdio("ok", true)).is_ok());
        let bad = Extension {
            name: "bad".to_string(),
            enabled: true,
            kind: ExtensionKind::Stdio {
                command: " ".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            },
        };
        assert!(validate(&bad).is_err());
        let unnamed = Extension {
            name: "".to_string(),
            enabled: true,
            kind: ExtensionKind::Frontend,
        };
        assert!(validate(&unnamed).is_err());
    }
}
