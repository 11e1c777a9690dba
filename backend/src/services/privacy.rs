//! LLM-call-time privacy filter.
//!
//! A finer-grained, per-category sibling of the ingest redactor. It runs in
//! memory on the copies of events that are about to leave for the LLM;
//! stored data is never touched. Categories toggle independently through
//! `privacy_config`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::PrivacyConfig;

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("static regex"));
static IPV6: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{0,4}\b").expect("static regex")
});
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("static regex")
});
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+\d[\d\s().-]{7,}\d").expect("static regex"));
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("static regex"));
static USER_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(/home/|/Users/|[Cc]:\\Users\\)[^\s/\\]+").expect("static regex")
});
static MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b").expect("static regex")
});
static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").expect("static regex")
});
static PASSWORD_KV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|pwd)(\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#)
        .expect("static regex")
});
static API_KEY_KV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|token|secret)(\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#)
        .expect("static regex")
});
static USERNAME_KV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(user(?:name)?)(\s*[=:]\s*)\S+").expect("static regex")
});

/// Compiled privacy filter for one configuration snapshot.
pub struct PrivacyFilter {
    config: PrivacyConfig,
    custom: Vec<Regex>,
}

impl PrivacyFilter {
    pub fn new(config: PrivacyConfig) -> Self {
        let custom = config
            .custom_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(&format!("(?i){}", pattern)) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Skipping invalid privacy pattern '{}': {}", pattern, e);
                    None
                },
            })
            .collect();
        Self { config, custom }
    }

    /// Transform one text field. Order: structured secrets first, then the
    /// broad address/identifier categories, then custom patterns.
    pub fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.mask_passwords {
            result = PASSWORD_KV.replace_all(&result, "${1}${2}<MASKED>").into_owned();
        }
        if self.config.mask_api_keys {
            result = API_KEY_KV.replace_all(&result, "${1}${2}<MASKED>").into_owned();
        }
        if self.config.mask_usernames {
            result = USERNAME_KV.replace_all(&result, "${1}${2}<USER>").into_owned();
        }
        if self.config.mask_url {
            result = URL.replace_all(&result, "<URL>").into_owned();
        }
        if self.config.mask_email {
            result = EMAIL.replace_all(&result, "<EMAIL>").into_owned();
        }
        if self.config.mask_credit_card {
            result = CREDIT_CARD.replace_all(&result, "<CARD>").into_owned();
        }
        if self.config.mask_mac {
            result = MAC.replace_all(&result, "<MAC>").into_owned();
        }
        if self.config.mask_ipv4 {
            result = IPV4.replace_all(&result, "<IP>").into_owned();
        }
        if self.config.mask_ipv6 {
            result = IPV6.replace_all(&result, "<IP>").into_owned();
        }
        if self.config.mask_phone {
            result = PHONE.replace_all(&result, "<PHONE>").into_owned();
        }
        if self.config.mask_user_paths {
            result = USER_PATH.replace_all(&result, "${1}<USER>").into_owned();
        }
        for regex in &self.custom {
            result = regex.replace_all(&result, "<MASKED>").into_owned();
        }

        result
    }

    /// Host field sent to the LLM, honoring strip_host.
    pub fn host_for_llm(&self, host: Option<&str>) -> Option<String> {
        if self.config.strip_host {
            None
        } else {
            host.map(|h| self.apply(h))
        }
    }

    /// Program field sent to the LLM, honoring strip_program.
    pub fn program_for_llm(&self, program: Option<&str>) -> Option<String> {
        if self.config.strip_program {
            None
        } else {
            program.map(|p| self.apply(p))
        }
    }
}
