//! Ingest-time secret redaction.
//!
//! An ordered list of regex substitutions runs over the message and,
//! recursively, over string values inside the JSON payload. Rule order
//! matters: quoted-value rules come before the unquoted ones so a greedy
//! `\S+` cannot swallow closing quotes. User-provided patterns are appended
//! and the whole set is compiled once, rebuilt only when the configured
//! pattern list changes.

use once_cell::sync::Lazy;
use regex::Regex;

pub const REDACTED: &str = "***";

/// Payload keys whose values are replaced outright, whatever they contain.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "access_key",
    "private_key",
    "client_secret",
    "refresh_token",
    "credentials",
];

struct BuiltinRule {
    regex: &'static Lazy<Regex>,
    replacement: &'static str,
}

static CONN_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://[^:/\s@]+:)([^@\s]+)@").expect("static regex")
});

static KEY_VALUE_DQUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|secret|api[_-]?key|token|access[_-]?key|private[_-]?key|credentials)(\s*[=:]\s*)"[^"]*""#,
    )
    .expect("static regex")
});

static KEY_VALUE_SQUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(password|passwd|secret|api[_-]?key|token|access[_-]?key|private[_-]?key|credentials)(\s*[=:]\s*)'[^']*'",
    )
    .expect("static regex")
});

static KEY_VALUE_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(password|passwd|secret|api[_-]?key|token|access[_-]?key|private[_-]?key|credentials)(\s*[=:]\s*)\S+",
    )
    .expect("static regex")
});

static AUTH_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(authorization)(\s*:\s*)[^\r\n]+").expect("static regex")
});

/// Ordered builtin rules. Connection strings first (their "secret" is
/// positional), then quoted forms, then the greedy bare form, then headers.
static BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule { regex: &CONN_STRING, replacement: "${1}***@" },
    BuiltinRule { regex: &KEY_VALUE_DQUOTED, replacement: "${1}${2}\"***\"" },
    BuiltinRule { regex: &KEY_VALUE_SQUOTED, replacement: "${1}${2}'***'" },
    BuiltinRule { regex: &KEY_VALUE_BARE, replacement: "${1}${2}***" },
    BuiltinRule { regex: &AUTH_HEADER, replacement: "${1}${2}***" },
];

/// Compiled redaction rule set. Construction is cheap enough to rebuild on
/// configuration change but too expensive per event.
pub struct Redactor {
    user_rules: Vec<Regex>,
    /// The pattern list this instance was compiled from
    source_patterns: Vec<String>,
}

impl Redactor {
    pub fn new(user_patterns: &[String]) -> Self {
        let user_rules = user_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(&format!("(?i){}", pattern)) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Skipping invalid redaction pattern '{}': {}", pattern, e);
                    None
                },
            })
            .collect();
        Self { user_rules, source_patterns: user_patterns.to_vec() }
    }

    /// Whether this instance still matches the configured pattern list.
    pub fn is_current(&self, user_patterns: &[String]) -> bool {
        self.source_patterns == user_patterns
    }

    /// Redact a message string.
    pub fn redact_text(&self, text: &str) -> String {
        let mut result = text.to_string();
        for rule in BUILTIN_RULES {
            result = rule.regex.replace_all(&result, rule.replacement).into_owned();
        }
        for regex in &self.user_rules {
            result = regex.replace_all(&result, REDACTED).into_owned();
        }
        result
    }

    /// Redact a JSON payload in place: sensitive keys are replaced outright,
    /// other string values are pattern-substituted.
    pub fn redact_json(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if SENSITIVE_KEYS.contains(&key.to_lowercase().as_str()) {
                        *entry = serde_json::Value::String(REDACTED.to_string());
                    } else {
                        self.redact_json(entry);
                    }
                }
            },
            serde_json::Value::Array(items) => {
                for item in items {
                    self.redact_json(item);
                }
            },
            serde_json::Value::String(s) => {
                let redacted = self.redact_text(s);
                if redacted != *s {
                    *s = redacted;
                }
            },
            _ => {},
        }
    }
}
