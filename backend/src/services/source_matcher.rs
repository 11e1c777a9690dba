//! Map a normalized event to its (system, log source).
//!
//! Precedence is fixed: exact connector id, then host, then source ip, then
//! program, each matched against the log_sources hints. An unmatched event
//! is handed to the discovery buffer by the ingest writer.

use sqlx::SqlitePool;

use crate::models::LogSource;
use crate::services::normalizer::NormalizedEvent;
use crate::utils::ApiResult;

#[derive(Clone)]
pub struct SourceMatcher {
    pool: SqlitePool,
}

impl SourceMatcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load every source once per batch; matching is then in-memory.
    pub async fn load_sources(&self) -> ApiResult<Vec<LogSource>> {
        let sources: Vec<LogSource> =
            sqlx::query_as("SELECT * FROM log_sources ORDER BY system_id, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    /// First match wins, in hint precedence order across all sources.
    pub fn match_event(sources: &[LogSource], event: &NormalizedEvent) -> Option<(i64, i64)> {
        if let Some(connector_id) = event.connector_id.as_deref() {
            if let Some(source) = sources
                .iter()
                .find(|s| s.connector_id_hint.as_deref() == Some(connector_id))
            {
                return Some((source.system_id, source.id));
            }
        }

        if let Some(host) = event.host.as_deref() {
            if let Some(source) = sources
                .iter()
                .find(|s| s.host_hint.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(host)))
            {
                return Some((source.system_id, source.id));
            }
        }

        if let Some(source_ip) = event.source_ip.as_deref() {
            if let Some(source) = sources
                .iter()
                .find(|s| s.source_ip_hint.as_deref() == Some(source_ip))
            {
                return Some((source.system_id, source.id));
            }
        }

        if let Some(program) = event.program.as_deref() {
            if let Some(source) = sources.iter().find(|s| {
                s.program_hint.as_deref().is_some_and(|p| p.eq_ignore_ascii_case(program))
            }) {
                return Some((source.system_id, source.id));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn source(
        id: i64,
        system_id: i64,
        host: Option<&str>,
        program: Option<&str>,
        source_ip: Option<&str>,
        connector: Option<&str>,
    ) -> LogSource {
        LogSource {
            id,
            system_id,
            label: format!("source-{}", id),
            host_hint: host.map(String::from),
            program_hint: program.map(String::from),
            source_ip_hint: source_ip.map(String::from),
            connector_id_hint: connector.map(String::from),
            created_at: Utc::now(),
        }
    }

    fn event(
        host: Option<&str>,
        program: Option<&str>,
        source_ip: Option<&str>,
        connector: Option<&str>,
    ) -> NormalizedEvent {
        NormalizedEvent {
            timestamp: Utc::now(),
            received_at: Utc::now(),
            message: "m".into(),
            severity: None,
            host: host.map(String::from),
            source_ip: source_ip.map(String::from),
            service: None,
            facility: None,
            program: program.map(String::from),
            trace_id: None,
            span_id: None,
            connector_id: connector.map(String::from),
            external_id: None,
            payload: serde_json::Value::Null,
            future_clamped: false,
        }
    }

    #[test]
    fn test_connector_beats_host() {
        let sources = vec![
            source(1, 10, Some("web-01"), None, None, None),
            source(2, 20, None, None, None, Some("conn-a")),
        ];
        let e = event(Some("web-01"), None, None, Some("conn-a"));
        assert_eq!(SourceMatcher::match_event(&sources, &e), Some((20, 2)));
    }

    #[test]
    fn test_host_beats_program() {
        let sources = vec![
            source(1, 10, None, Some("nginx"), None, None),
            source(2, 20, Some("web-01"), None, None, None),
        ];
        let e = event(Some("WEB-01"), Some("nginx"), None, None);
        assert_eq!(SourceMatcher::match_event(&sources, &e), Some((20, 2)));
    }

    #[test]
    fn test_no_match() {
        let sources = vec![source(1, 10, Some("other"), None, None, None)];
        let e = event(Some("web-01"), None, None, None);
        assert_eq!(SourceMatcher::match_event(&sources, &e), None);
    }
}
