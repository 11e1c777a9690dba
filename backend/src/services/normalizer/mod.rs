//! Event normalization: turn one opaque shipper entry into a canonical
//! event, or reject it.
//!
//! Stages: ECS flattening, message resolution (with JSON-body extraction),
//! timestamp resolution, severity resolution + content enrichment, host and
//! source-ip cleaning, future-timestamp guard. Timezone correction runs
//! later, once source matching has attached a system. Parse-level surprises
//! never error; only a missing message rejects the entry.

pub mod multiline;
pub mod severity;
pub mod timestamp;

pub use multiline::MultilineReassembler;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::MonitoredSystem;
use crate::utils::StringExt;

pub type RawEntry = serde_json::Map<String, serde_json::Value>;

/// Canonical event produced by normalization, before persistence.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub message: String,
    pub severity: Option<String>,
    pub host: Option<String>,
    pub source_ip: Option<String>,
    pub service: Option<String>,
    pub facility: Option<String>,
    pub program: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub connector_id: Option<String>,
    pub external_id: Option<String>,
    /// Remaining shipper payload, redacted before storage
    pub payload: serde_json::Value,
    /// Set when the future-timestamp guard clamped the timestamp
    pub future_clamped: bool,
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub max_message_length: usize,
    pub max_future_drift_seconds: i64,
    /// Transport peer address, the last-resort source_ip
    pub peer_addr: Option<String>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self { max_message_length: 8192, max_future_drift_seconds: 300, peer_addr: None }
    }
}

/// Nested ECS paths copied onto flat fields when the flat field is empty.
/// Explicit flat fields always take priority.
const ECS_MAPPINGS: &[(&str, &str)] = &[
    ("host.name", "host"),
    ("resource.host.name", "host"),
    ("source.ip", "source_ip"),
    ("client.ip", "source_ip"),
    ("service.name", "service"),
    ("resource.service.name", "service"),
    ("log.level", "severity"),
    ("process.name", "program"),
    ("log.syslog.facility.name", "facility"),
    ("trace.id", "trace_id"),
    ("span.id", "span_id"),
    ("attributes.trace_id", "trace_id"),
    ("attributes.span_id", "span_id"),
];

const MESSAGE_FIELDS: &[&str] = &["message", "short_message", "msg", "body"];
const SOURCE_IP_FIELDS: &[&str] = &["source_ip", "fromhost_ip", "ip", "client_ip", "src_ip"];

pub const TRUNCATION_MARKER: &str = "[...truncated]";

/// Normalize one raw entry. `Err` carries the rejection reason
/// ("invalid_entry" variants only).
pub fn normalize(
    mut map: RawEntry,
    now: DateTime<Utc>,
    opts: &NormalizeOptions,
) -> Result<NormalizedEvent, String> {
    flatten_ecs(&mut map);

    // Message first: without one the entry is rejected outright.
    let raw_message = resolve_message(&map).ok_or_else(|| "invalid_entry: missing message".to_string())?;

    // A structured JSON body (Pino/Bunyan/Winston) may carry both the real
    // message and a level.
    let (message, body_level) = extract_json_body(&raw_message);
    let message = truncate_message(&message, opts.max_message_length);

    let mut timestamp = timestamp::resolve(&map, now);

    let severity_header = resolve_severity(&mut map, body_level.as_deref());
    let severity = severity::enrich(severity_header.as_deref(), &message);

    let (host, source_ip) = resolve_host_and_ip(&map, opts.peer_addr.as_deref());

    // Future guard: clamp runaway clocks to now.
    let mut future_clamped = false;
    if timestamp > now + Duration::seconds(opts.max_future_drift_seconds) {
        timestamp = now;
        future_clamped = true;
    }

    let service = get_string(&map, "service");
    let facility = get_string(&map, "facility");
    let program = get_string(&map, "program").or_else(|| get_string(&map, "app_name"));
    let trace_id = get_string(&map, "trace_id");
    let span_id = get_string(&map, "span_id");
    let connector_id = get_string(&map, "connector_id");
    let external_id = get_string(&map, "external_id");

    Ok(NormalizedEvent {
        timestamp,
        received_at: now,
        message,
        severity,
        host,
        source_ip,
        service,
        facility,
        program,
        trace_id,
        span_id,
        connector_id,
        external_id,
        payload: serde_json::Value::Object(map),
        future_clamped,
    })
}

/// Copy nested ECS values onto absent/empty flat fields.
fn flatten_ecs(map: &mut RawEntry) {
    // @timestamp is a flat key, not a path
    if !has_value(map, "timestamp") {
        if let Some(ts) = map.get("@timestamp").cloned() {
            map.insert("timestamp".to_string(), ts);
        }
    }

    for (path, flat) in ECS_MAPPINGS {
        if has_value(map, flat) {
            continue;
        }
        if let Some(value) = lookup_path(map, path) {
            map.insert(flat.to_string(), value);
        }
    }
}

fn lookup_path(map: &RawEntry, path: &str) -> Option<serde_json::Value> {
    let mut current = map;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let value = current.get(*segment)?;
        if i == segments.len() - 1 {
            return match value {
                serde_json::Value::String(s) if s.trim().is_empty() => None,
                serde_json::Value::Null => None,
                v => Some(v.clone()),
            };
        }
        current = value.as_object()?;
    }
    None
}

fn has_value(map: &RawEntry, key: &str) -> bool {
    match map.get(key) {
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    }
}

fn get_string(map: &RawEntry, key: &str) -> Option<String> {
    match map.get(key) {
        Some(serde_json::Value::String(s)) => s.clean(),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_message(map: &RawEntry) -> Option<String> {
    MESSAGE_FIELDS.iter().find_map(|f| get_string(map, f))
}

/// If the message is a JSON object in the Pino/Bunyan/Winston shape, pull
/// out the real message text and the level.
fn extract_json_body(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return (raw.to_string(), None);
    }

    let Ok(serde_json::Value::Object(body)) = serde_json::from_str(trimmed) else {
        return (raw.to_string(), None);
    };

    let level = ["level", "severity", "loglevel", "lvl"]
        .iter()
        .find_map(|k| match body.get(*k) {
            Some(serde_json::Value::String(s)) => s.clean(),
            Some(serde_json::Value::Number(n)) => {
                n.as_i64().and_then(severity::from_syslog_number).map(|s| s.to_string())
            },
            _ => None,
        });

    let inner = ["msg", "message", "text"]
        .iter()
        .find_map(|k| body.get(*k).and_then(|v| v.as_str()).and_then(|s| s.clean()));

    match inner {
        Some(text) => (text, level),
        None => (raw.to_string(), level),
    }
}

fn truncate_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    let truncated: String = message.chars().take(max_len).collect();
    format!("{} {}", truncated, TRUNCATION_MARKER)
}

/// Resolve severity in strict order; first match wins.
fn resolve_severity(map: &mut RawEntry, body_level: Option<&str>) -> Option<String> {
    // 1. Non-empty string fields
    for field in ["severity", "level", "syslog_severity", "severity_text"] {
        if let Some(serde_json::Value::String(s)) = map.get(field) {
            if let Some(canonical) = severity::canonicalize(s) {
                return Some(canonical.to_string());
            }
        }
    }

    // 2. Numeric severity/level as syslog 0-7
    for field in ["severity", "level"] {
        if let Some(serde_json::Value::Number(n)) = map.get(field) {
            if let Some(canonical) = n.as_i64().and_then(severity::from_syslog_number) {
                return Some(canonical.to_string());
            }
        }
    }

    // 3. OTel severity_number 1-24
    if let Some(serde_json::Value::Number(n)) = map.get("severity_number") {
        if let Some(canonical) = n.as_i64().and_then(severity::from_otel_number) {
            return Some(canonical.to_string());
        }
    }

    // 4. RFC 5424 PRI, which also yields the facility
    let pri = match map.get("pri") {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    if let Some((sev, facility)) = pri.and_then(severity::from_pri) {
        if !has_value(map, "facility") {
            if let Some(facility) = facility {
                map.insert("facility".to_string(), serde_json::json!(facility));
            }
        }
        return Some(sev.to_string());
    }

    // 5. Level extracted from a JSON message body
    body_level
        .and_then(severity::canonicalize)
        .map(|s| s.to_string())
}

static TRANSPORT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").expect("static regex"));
static BOGUS_HOST_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}T\d{2}:)").expect("static regex"));
static BOGUS_HOST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?$").expect("static regex"));

/// Strip transport decorations from an address: scheme prefixes,
/// bracketed IPv6, trailing ports.
pub fn clean_transport_address(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(m) = TRANSPORT_PREFIX.find(s) {
        s = &s[m.end()..];
    }

    // [::1]:5140 or [2001:db8::1]
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].clean();
        }
    }

    // 1.2.3.4:52502 - strip the port only when one colon separates an
    // address-looking left side from digits; bare IPv6 keeps its colons.
    if s.matches(':').count() == 1 {
        if let Some((left, right)) = s.split_once(':') {
            if !right.is_empty() && right.chars().all(|c| c.is_ascii_digit()) {
                return left.clean();
            }
        }
    }

    s.clean()
}

fn parse_ipv4(s: &str) -> Option<std::net::Ipv4Addr> {
    s.parse().ok()
}

/// Docker bridge and loopback ranges that mask the true origin.
fn is_nat_masked(ip: &str) -> bool {
    if ip == "127.0.0.1" || ip == "::1" {
        return true;
    }
    match parse_ipv4(ip) {
        Some(v4) => {
            let octets = v4.octets();
            octets[0] == 172 && (16..=31).contains(&octets[1])
        },
        None => false,
    }
}

/// A host value that is really misaligned parser output: timestamps, bare
/// numbers, punctuation runs.
fn is_bogus_host(host: &str) -> bool {
    BOGUS_HOST_TIME.is_match(host)
        || BOGUS_HOST_NUMBER.is_match(host)
        || host.chars().all(|c| c.is_ascii_punctuation())
}

fn resolve_host_and_ip(
    map: &RawEntry,
    peer_addr: Option<&str>,
) -> (Option<String>, Option<String>) {
    let mut source_ip = SOURCE_IP_FIELDS
        .iter()
        .find_map(|f| get_string(map, f))
        .and_then(|raw| clean_transport_address(&raw));

    if source_ip.is_none() {
        source_ip = peer_addr.and_then(clean_transport_address);
    }

    let mut host = get_string(map, "host")
        .or_else(|| get_string(map, "hostname"))
        .filter(|h| !is_bogus_host(h));

    // Docker-NAT override: a bridge/loopback source_ip next to a real IPv4
    // host means the header host is the true origin.
    if let (Some(ip), Some(h)) = (&source_ip, &host) {
        if is_nat_masked(ip) {
            if let Some(host_v4) = parse_ipv4(h) {
                let octets = host_v4.octets();
                let host_masked =
                    octets[0] == 127 || (octets[0] == 172 && (16..=31).contains(&octets[1]));
                if !host_masked {
                    source_ip = Some(h.clone());
                }
            }
        }
    }

    if host.is_none() {
        host = source_ip.clone();
    }

    (host, source_ip)
}

/// Apply the system's timezone correction to a parsed timestamp.
///
/// With an IANA name, the offsets of the system tz and the collector tz are
/// computed at the event instant (DST-correct) and the delta subtracted.
/// Otherwise a fixed minute offset is subtracted. received_at is never
/// touched.
pub fn correct_timezone(
    timestamp: DateTime<Utc>,
    system: &MonitoredSystem,
    collector_tz: chrono_tz::Tz,
) -> DateTime<Utc> {
    use chrono::Offset;

    if let Some(name) = system.timezone_name.as_deref() {
        if let Ok(system_tz) = name.parse::<chrono_tz::Tz>() {
            let system_offset =
                timestamp.with_timezone(&system_tz).offset().fix().local_minus_utc() as i64;
            let collector_offset =
                timestamp.with_timezone(&collector_tz).offset().fix().local_minus_utc() as i64;
            let delta = system_offset - collector_offset;
            return timestamp - Duration::seconds(delta);
        }
        tracing::warn!("System {} has invalid timezone '{}'", system.id, name);
    }

    if let Some(minutes) = system.tz_offset_minutes {
        return timestamp - Duration::minutes(minutes);
    }

    timestamp
}

static PARAM_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("static regex")
});
static PARAM_IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(\.\d{1,3}){3}\b").expect("static regex"));
static PARAM_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("static regex"));
static PARAM_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Collapse the variable parts of a message so equal-shaped events share a
/// template: UUIDs -> <ID>, IPs -> <IP>, long hex -> <H>, numbers -> <N>.
pub fn parameterize_message(message: &str) -> String {
    let result = PARAM_UUID.replace_all(message, "<ID>");
    let result = PARAM_IPV4.replace_all(&result, "<IP>");
    let result = PARAM_HEX.replace_all(&result, "<H>");
    let result = PARAM_NUM.replace_all(&result, "<N>");
    result.into_owned()
}

/// Stable template id of a message: truncated SHA-256 of its parameterized
/// form. Events sharing a template are scored once per batch.
pub fn message_template_id(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parameterize_message(message).as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// SHA-256 over the NUL-joined normalized fields. Computed after redaction
/// so the hash reflects stored content.
pub fn compute_normalized_hash(event: &NormalizedEvent) -> String {
    let mut hasher = Sha256::new();
    let fields = [
        event.timestamp.to_rfc3339(),
        event.message.clone(),
        event.host.clone().unwrap_or_default(),
        event.source_ip.clone().unwrap_or_default(),
        event.service.clone().unwrap_or_default(),
        event.program.clone().unwrap_or_default(),
        event.facility.clone().unwrap_or_default(),
    ];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(json: serde_json::Value) -> RawEntry {
        json.as_object().expect("test entry must be an object").clone()
    }

    #[test]
    fn test_missing_message_rejected() {
        let now = Utc::now();
        let result = normalize(entry(serde_json::json!({"host": "web-01"})), now, &NormalizeOptions::default());
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("invalid_entry"));
    }

    #[test]
    fn test_message_alias_resolution() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({"short_message": "from gelf"})),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.message, "from gelf");
    }

    #[test]
    fn test_ecs_flattening_respects_flat_priority() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({
                "message": "m",
                "host": "flat-host",
                "source": {"ip": "10.0.0.9"},
                "service": {"name": "payments"}
            })),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.host.as_deref(), Some("flat-host"));
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(event.service.as_deref(), Some("payments"));
    }

    #[test]
    fn test_json_body_extraction() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({
                "message": "{\"level\":\"error\",\"msg\":\"pool exhausted\"}"
            })),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.message, "pool exhausted");
        assert_eq!(event.severity.as_deref(), Some("error"));
    }

    #[test]
    fn test_message_truncation_marker() {
        let now = Utc::now();
        let long = "x".repeat(100);
        let event = normalize(
            entry(serde_json::json!({"message": long})),
            now,
            &NormalizeOptions { max_message_length: 10, ..Default::default() },
        )
        .unwrap();
        assert!(event.message.starts_with("xxxxxxxxxx"));
        assert!(event.message.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_severity_priority_string_over_numeric() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({"message": "m", "severity": "warn", "severity_number": 24})),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.severity.as_deref(), Some("warning"));
    }

    #[test]
    fn test_pri_sets_severity_and_facility() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({"message": "m", "pri": 165})),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.severity.as_deref(), Some("notice"));
        assert_eq!(event.facility.as_deref(), Some("local4"));
    }

    #[test]
    fn test_transport_address_cleaning() {
        assert_eq!(clean_transport_address("udp://1.2.3.4:52502").as_deref(), Some("1.2.3.4"));
        assert_eq!(clean_transport_address("[::1]:5140").as_deref(), Some("::1"));
        assert_eq!(clean_transport_address("[2001:db8::1]").as_deref(), Some("2001:db8::1"));
        assert_eq!(clean_transport_address("10.0.0.1:9999").as_deref(), Some("10.0.0.1"));
        assert_eq!(clean_transport_address("2001:db8::1").as_deref(), Some("2001:db8::1"));
        // Idempotent on already-clean addresses
        assert_eq!(clean_transport_address("1.2.3.4").as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_docker_nat_override() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({
                "message": "hello",
                "source_ip": "172.17.0.1",
                "host": "10.20.30.40"
            })),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.host.as_deref(), Some("10.20.30.40"));
        assert_eq!(event.source_ip.as_deref(), Some("10.20.30.40"));
    }

    #[test]
    fn test_bogus_host_falls_back_to_source_ip() {
        let now = Utc::now();
        let event = normalize(
            entry(serde_json::json!({
                "message": "m",
                "host": "12:30:01",
                "source_ip": "10.1.1.1"
            })),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(event.host.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let now = Utc::now();
        let opts = NormalizeOptions::default();

        // One second inside the drift allowance: unchanged
        let inside = now + Duration::seconds(opts.max_future_drift_seconds - 1);
        let event = normalize(
            entry(serde_json::json!({"message": "m", "timestamp": inside.to_rfc3339()})),
            now,
            &opts,
        )
        .unwrap();
        assert!(!event.future_clamped);

        // Past the allowance: clamped to now
        let outside = now + Duration::seconds(opts.max_future_drift_seconds + 1);
        let event = normalize(
            entry(serde_json::json!({"message": "m", "timestamp": outside.to_rfc3339()})),
            now,
            &opts,
        )
        .unwrap();
        assert!(event.future_clamped);
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn test_normalized_hash_changes_with_fields() {
        let now = Utc::now();
        let a = normalize(
            entry(serde_json::json!({"message": "m", "host": "a", "timestamp": "2024-06-01T00:00:00Z"})),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        let b = normalize(
            entry(serde_json::json!({"message": "m", "host": "b", "timestamp": "2024-06-01T00:00:00Z"})),
            now,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_ne!(compute_normalized_hash(&a), compute_normalized_hash(&b));
        assert_eq!(compute_normalized_hash(&a), compute_normalized_hash(&a));
    }

    #[test]
    fn test_parameterize_message() {
        let a = parameterize_message(
            "req 550e8400-e29b-41d4-a716-446655440000 from 10.0.0.1 took 35ms",
        );
        let b = parameterize_message(
            "req 123e4567-e89b-12d3-a456-426614174000 from 10.9.9.9 took 7ms",
        );
        assert_eq!(a, b);
        assert_eq!(a, "req <ID> from <IP> took <N>ms");
        assert_eq!(message_template_id(
            "req 550e8400-e29b-41d4-a716-446655440000 from 10.0.0.1 took 35ms"
        ).len(), 16);
    }

    #[test]
    fn test_timezone_correction_fixed_offset() {
        let system = MonitoredSystem {
            id: 1,
            name: "s".into(),
            description: None,
            retention_days: None,
            event_source: "relational".into(),
            timezone_name: None,
            tz_offset_minutes: Some(120),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let ts = "2024-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let corrected = correct_timezone(ts, &system, chrono_tz::UTC);
        assert_eq!(corrected, "2024-06-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_timezone_correction_iana_dst() {
        let system = MonitoredSystem {
            id: 1,
            name: "s".into(),
            description: None,
            retention_days: None,
            event_source: "relational".into(),
            timezone_name: Some("Europe/Berlin".into()),
            tz_offset_minutes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        // June: Berlin is UTC+2
        let summer = "2024-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let corrected = correct_timezone(summer, &system, chrono_tz::UTC);
        assert_eq!(corrected, "2024-06-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());

        // January: Berlin is UTC+1
        let winter = "2024-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let corrected = correct_timezone(winter, &system, chrono_tz::UTC);
        assert_eq!(corrected, "2024-01-01T11:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }
}
