//! Git-style configuration files, reduced to the read-only surface the
//! index subsystems consume.
//!
//! Supports `[section]` and `[section "subsection"]` headers, `key = value`
//! lines, value-less keys (implicit `true`), quoted values, `#`/`;`
//! comments, and git's boolean literal set. Later assignments win, as in
//! git's "last one wins" rule.

use std::collections::HashMap;
use std::path::Path;

/// Errors from configuration parsing and typed access.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed config line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("key '{key}' has non-boolean value '{value}'")]
    NotABoolean { key: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed configuration file.
///
/// Keys are stored fully qualified and lowercased in their section/key
/// parts (`core.sparsecheckout`, `extensions.sparseindex`); subsection
/// names keep their case, matching git's semantics.
#[derive(Debug, Default, Clone)]
pub struct ConfigFile {
    values: HashMap<String, String>,
}

impl ConfigFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config file from disk; a missing file is an empty config.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        let mut section: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let inner = rest.strip_suffix(']').ok_or(ConfigError::Malformed {
                    line: lineno + 1,
                    reason: "unterminated section header".into(),
                })?;
                section = Some(parse_section_header(inner, lineno + 1)?);
                continue;
            }

            let section = section.as_ref().ok_or(ConfigError::Malformed {
                line: lineno + 1,
                reason: "key outside any section".into(),
            })?;

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), unquote(value.trim())),
                // A bare key means boolean true.
                None => (line, "true".to_string()),
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(ConfigError::Malformed {
                    line: lineno + 1,
                    reason: format!("invalid key name '{key}'"),
                });
            }

            values.insert(format!("{section}.{}", key.to_ascii_lowercase()), value);
        }

        Ok(Self { values })
    }

    /// Raw string value for a fully qualified key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    /// Boolean value using git's literal set: `true`/`yes`/`on`/`1` and
    /// `false`/`no`/`off`/`0`/empty.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match parse_bool(value) {
            Some(b) => Ok(Some(b)),
            None => Err(ConfigError::NotABoolean {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Boolean with a default for unset keys.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Git boolean literals.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}

fn normalize_key(key: &str) -> String {
    match key.rsplit_once('.') {
        Some((prefix, name)) => match prefix.split_once('.') {
            // section.subsection.key: only section and key fold case.
            Some((section, sub)) => format!(
                "{}.{sub}.{}",
                section.to_ascii_lowercase(),
                name.to_ascii_lowercase()
            ),
            None => format!(
                "{}.{}",
                prefix.to_ascii_lowercase(),
                name.to_ascii_lowercase()
            ),
        },
        None => key.to_ascii_lowercase(),
    }
}

fn parse_section_header(inner: &str, line: usize) -> Result<String, ConfigError> {
    let inner = inner.trim();
    if let Some((name, rest)) = inner.split_once(char::is_whitespace) {
        let rest = rest.trim();
        let sub = rest
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or(ConfigError::Malformed {
                line,
                reason: "subsection must be quoted".into(),
            })?;
        Ok(format!("{}.{}", name.to_ascii_lowercase(), sub))
    } else {
        Ok(inner.to_ascii_lowercase())
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '#' | ';' if !in_quote => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}
