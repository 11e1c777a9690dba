//! Severity resolution and content-based enrichment.
//!
//! Resolution order is strict: explicit string fields, numeric syslog
//! severities, OTel severity_number ranges, RFC 5424 PRI, then a level
//! extracted from a JSON message body. Content enrichment afterwards may
//! only raise the severity, never lower it.

use once_cell::sync::Lazy;
use regex::Regex;

/// Canonical RFC 5424 severities, most severe first.
pub const SEVERITIES: [&str; 8] =
    ["emergency", "alert", "critical", "error", "warning", "notice", "info", "debug"];

/// Numeric rank of a canonical severity: 0 = emergency .. 7 = debug.
/// Unknown strings rank as debug so they can always be raised.
pub fn severity_rank(severity: &str) -> u8 {
    SEVERITIES
        .iter()
        .position(|s| *s == severity)
        .map(|p| p as u8)
        .unwrap_or(7)
}

/// Canonicalize an arbitrary severity token to the RFC 5424 set.
pub fn canonicalize(raw: &str) -> Option<&'static str> {
    let token = raw.trim().to_lowercase();
    let canonical = match token.as_str() {
        "emergency" | "emerg" | "panic" => "emergency",
        "alert" => "alert",
        "critical" | "crit" | "fatal" => "critical",
        "error" | "err" => "error",
        "warning" | "warn" => "warning",
        "notice" => "notice",
        "info" | "informational" | "information" => "info",
        "debug" | "trace" | "verbose" => "debug",
        _ => return None,
    };
    Some(canonical)
}

/// Map a syslog numeric severity (0-7).
pub fn from_syslog_number(n: i64) -> Option<&'static str> {
    match n {
        0 => Some("emergency"),
        1 => Some("alert"),
        2 => Some("critical"),
        3 => Some("error"),
        4 => Some("warning"),
        5 => Some("notice"),
        6 => Some("info"),
        7 => Some("debug"),
        _ => None,
    }
}

/// Map an OTel severity_number (1-24) by range.
pub fn from_otel_number(n: i64) -> Option<&'static str> {
    match n {
        1..=8 => Some("debug"),
        9..=12 => Some("info"),
        13..=16 => Some("warning"),
        17..=20 => Some("error"),
        21..=24 => Some("critical"),
        _ => None,
    }
}

/// RFC 5424 facility names by number.
pub fn facility_name(n: i64) -> Option<&'static str> {
    match n {
        0 => Some("kern"),
        1 => Some("user"),
        2 => Some("mail"),
        3 => Some("daemon"),
        4 => Some("auth"),
        5 => Some("syslog"),
        6 => Some("lpr"),
        7 => Some("news"),
        8 => Some("uucp"),
        9 => Some("cron"),
        10 => Some("authpriv"),
        11 => Some("ftp"),
        12 => Some("ntp"),
        13 => Some("security"),
        14 => Some("console"),
        15 => Some("solaris-cron"),
        16 => Some("local0"),
        17 => Some("local1"),
        18 => Some("local2"),
        19 => Some("local3"),
        20 => Some("local4"),
        21 => Some("local5"),
        22 => Some("local6"),
        23 => Some("local7"),
        _ => None,
    }
}

/// Decode an RFC 5424 PRI value into (severity, facility).
pub fn from_pri(pri: i64) -> Option<(&'static str, Option<&'static str>)> {
    if !(0..=191).contains(&pri) {
        return None;
    }
    let severity = from_syslog_number(pri % 8)?;
    Some((severity, facility_name(pri / 8)))
}

struct ContentRule {
    severity: &'static str,
    patterns: &'static [&'static str],
}

/// Ordered content rules, most severe first. The first matching rule wins,
/// so a kernel panic is never classified as a mere error.
const CONTENT_RULES: &[ContentRule] = &[
    ContentRule {
        severity: "emergency",
        patterns: &[r"\bkernel\s+panic\b", r"\bsystem\s+halted\b"],
    },
    ContentRule {
        severity: "alert",
        patterns: &[r"\bdata\s+corruption\b", r"\bdisk\s+failure\b", r"\braid\s+degraded\b"],
    },
    ContentRule {
        severity: "critical",
        patterns: &[
            r"\bsegmentation\s+fault\b",
            r"\bout\s+of\s+memory\b",
            r"\boom-?killer\b",
            r"\bwill\s+not\s+be\s+restarted\b",
            r"\bfatal\s+error\b",
            r#"\blevel\s*[=:]\s*"?(crit(ical)?|fatal)\b"#,
        ],
    },
    ContentRule {
        severity: "error",
        patterns: &[
            r#"\blevel\s*[=:]\s*"?err(or)?\b"#,
            r"\bpermission\s+denied\b",
            r"\bconnection\s+refused\b",
            r"\bno\s+such\s+file\s+or\s+directory\b",
            r"\buncaught\s+exception\b",
            r"\btraceback\s+\(most\s+recent\s+call\s+last\)",
            r"\bfailed\s+to\s+(start|open|connect|bind)\b",
        ],
    },
    ContentRule {
        severity: "warning",
        patterns: &[
            r#"\blevel\s*[=:]\s*"?warn(ing)?\b"#,
            r"\bdeprecated\b",
            r"\bcertificate\s+(is\s+)?expir",
            r"\bclock\s+skew\b",
        ],
    },
    ContentRule { severity: "notice", patterns: &[r#"\blevel\s*[=:]\s*"?notice\b"#] },
    ContentRule { severity: "info", patterns: &[r#"\blevel\s*[=:]\s*"?info\b"#] },
    ContentRule { severity: "debug", patterns: &[r#"\blevel\s*[=:]\s*"?(debug|trace)\b"#] },
];

static COMPILED_CONTENT_RULES: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    CONTENT_RULES
        .iter()
        .map(|rule| {
            let regexes = rule
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(&format!("(?i){}", p)).expect("builtin content rule must compile")
                })
                .collect();
            (rule.severity, regexes)
        })
        .collect()
});

/// Severity implied by the message content, if any.
pub fn content_severity(message: &str) -> Option<&'static str> {
    for (severity, regexes) in COMPILED_CONTENT_RULES.iter() {
        if regexes.iter().any(|r| r.is_match(message)) {
            return Some(severity);
        }
    }
    None
}

/// Combine header and content severities: the more severe one wins, and a
/// missing header severity is simply set from content.
pub fn enrich(header: Option<&str>, message: &str) -> Option<String> {
    let content = content_severity(message);
    match (header, content) {
        (Some(h), Some(c)) => {
            if severity_rank(c) < severity_rank(h) {
                Some(c.to_string())
            } else {
                Some(h.to_string())
            }
        },
        (Some(h), None) => Some(h.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_aliases() {
        assert_eq!(canonicalize("ERR"), Some("error"));
        assert_eq!(canonicalize("warn"), Some("warning"));
        assert_eq!(canonicalize("crit"), Some("critical"));
        assert_eq!(canonicalize("emerg"), Some("emergency"));
        assert_eq!(canonicalize("fatal"), Some("critical"));
        assert_eq!(canonicalize("panic"), Some("emergency"));
        assert_eq!(canonicalize("trace"), Some("debug"));
        assert_eq!(canonicalize("verbose"), Some("debug"));
        assert_eq!(canonicalize("informational"), Some("info"));
        assert_eq!(canonicalize("nonsense"), None);
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        for severity in SEVERITIES {
            assert_eq!(canonicalize(severity), Some(severity));
        }
    }

    #[test]
    fn test_otel_ranges() {
        assert_eq!(from_otel_number(1), Some("debug"));
        assert_eq!(from_otel_number(8), Some("debug"));
        assert_eq!(from_otel_number(9), Some("info"));
        assert_eq!(from_otel_number(16), Some("warning"));
        assert_eq!(from_otel_number(20), Some("error"));
        assert_eq!(from_otel_number(24), Some("critical"));
        assert_eq!(from_otel_number(25), None);
    }

    #[test]
    fn test_pri_decoding() {
        // 165 = facility 20 (local4), severity 5 (notice)
        assert_eq!(from_pri(165), Some(("notice", Some("local4"))));
        // 0 = kern.emergency
        assert_eq!(from_pri(0), Some(("emergency", Some("kern"))));
        assert_eq!(from_pri(192), None);
        assert_eq!(from_pri(-1), None);
    }

    #[test]
    fn test_enrich_never_downgrades() {
        // Content says error, header says critical: header stays
        let enriched = enrich(Some("critical"), "connection refused by peer");
        assert_eq!(enriched.as_deref(), Some("critical"));

        // Content says critical, header says info: content wins
        let enriched = enrich(Some("info"), "process crashed with segmentation fault");
        assert_eq!(enriched.as_deref(), Some("critical"));

        // No header at all: content sets it
        let enriched = enrich(None, "kernel panic - not syncing");
        assert_eq!(enriched.as_deref(), Some("emergency"));
    }

    #[test]
    fn test_content_severity_order() {
        // Matches both the error and emergency tables; emergency wins
        let msg = "kernel panic: connection refused";
        assert_eq!(content_severity(msg), Some("emergency"));
    }
}
