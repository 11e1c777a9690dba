//! Ingest writer: accept a shipper batch, reassemble multiline entries,
//! normalize, redact, match sources, and persist.
//!
//! All rows of one request go into a single transaction with
//! `ON CONFLICT (normalized_hash, timestamp) DO NOTHING`, so shipper
//! retries are idempotent. Unmatched entries are buffered for source
//! discovery on a best-effort basis.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::IngestResponse;
use crate::services::app_config_service::AppConfigService;
use crate::services::normalizer::{
    self, MultilineReassembler, NormalizeOptions, NormalizedEvent, RawEntry,
};
use crate::services::redactor::Redactor;
use crate::services::source_matcher::SourceMatcher;
use crate::utils::{ApiError, ApiResult};

const INSERT_CHUNK: usize = 100;
const DISCOVERY_SAMPLE_LEN: usize = 500;

struct EventRow {
    id: String,
    event: NormalizedEvent,
    system_id: Option<i64>,
    log_source_id: Option<i64>,
    normalized_hash: String,
    template_id: String,
}

pub struct IngestService {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
    source_matcher: SourceMatcher,
    reassembler: MultilineReassembler,
    redactor: Mutex<Arc<Redactor>>,
    collector_tz: chrono_tz::Tz,
    max_batch_size: usize,
}

impl IngestService {
    pub fn new(
        pool: SqlitePool,
        config_service: Arc<AppConfigService>,
        collector_tz: chrono_tz::Tz,
        max_batch_size: usize,
    ) -> Self {
        Self {
            source_matcher: SourceMatcher::new(pool.clone()),
            pool,
            config_service,
            reassembler: MultilineReassembler::new(),
            redactor: Mutex::new(Arc::new(Redactor::new(&[]))),
            collector_tz,
            max_batch_size,
        }
    }

    /// Accept one ingest request body in any of the three supported shapes.
    pub async fn ingest(
        &self,
        body: serde_json::Value,
        peer_addr: Option<String>,
    ) -> ApiResult<IngestResponse> {
        let entries = parse_body(body)?;

        if entries.len() > self.max_batch_size {
            return Err(ApiError::BatchTooLarge {
                size: entries.len(),
                max: self.max_batch_size,
            });
        }

        let pipeline_config = self.config_service.pipeline_config().await;
        let now = Utc::now();

        let entries = if pipeline_config.multiline_reassembly {
            self.reassembler.reassemble(entries, now)
        } else {
            entries
        };

        let redactor = self.current_redactor().await;
        let sources = self.source_matcher.load_sources().await?;
        let systems: Vec<crate::models::MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems")
                .fetch_all(&self.pool)
                .await?;

        let opts = NormalizeOptions {
            max_message_length: pipeline_config.max_event_message_length,
            max_future_drift_seconds: pipeline_config.max_future_drift_seconds,
            peer_addr,
        };

        let mut rows: Vec<EventRow> = Vec::with_capacity(entries.len());
        let mut unmatched: Vec<NormalizedEvent> = Vec::new();
        let mut rejected = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for entry in entries {
            let mut event = match normalizer::normalize(entry, now, &opts) {
                Ok(event) => event,
                Err(reason) => {
                    rejected += 1;
                    if errors.len() < 20 {
                        errors.push(reason);
                    }
                    continue;
                },
            };

            event.message = redactor.redact_text(&event.message);
            redactor.redact_json(&mut event.payload);

            let matched = SourceMatcher::match_event(&sources, &event);
            if let Some((system_id, _)) = matched {
                if let Some(system) = systems.iter().find(|s| s.id == system_id) {
                    event.timestamp =
                        normalizer::correct_timezone(event.timestamp, system, self.collector_tz);
                }
            } else {
                unmatched.push(event.clone());
            }

            let normalized_hash = normalizer::compute_normalized_hash(&event);
            let template_id = normalizer::message_template_id(&event.message);

            rows.push(EventRow {
                id: Uuid::new_v4().to_string(),
                system_id: matched.map(|(s, _)| s),
                log_source_id: matched.map(|(_, l)| l),
                normalized_hash,
                template_id,
                event,
            });
        }

        let accepted = rows.len();

        if accepted > 0 {
            self.insert_rows(&rows).await?;
        }

        if !unmatched.is_empty() {
            self.buffer_for_discovery(unmatched).await;
        }

        tracing::debug!("Ingest batch done: accepted={}, rejected={}", accepted, rejected);

        Ok(IngestResponse {
            accepted,
            rejected,
            errors: if errors.is_empty() { None } else { Some(errors) },
        })
    }

    /// One transaction, chunked inserts, conflict-ignoring dedup.
    async fn insert_rows(&self, rows: &[EventRow]) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO events (id, timestamp, received_at, system_id, log_source_id, \
                 connector_id, message, severity, host, source_ip, service, facility, program, \
                 trace_id, span_id, payload, normalized_hash, external_id, template_id) ",
            );
            builder.push_values(chunk, |mut b, row| {
                let payload = serde_json::to_string(&row.event.payload).unwrap_or_default();
                b.push_bind(&row.id)
                    .push_bind(row.event.timestamp)
                    .push_bind(row.event.received_at)
                    .push_bind(row.system_id)
                    .push_bind(row.log_source_id)
                    .push_bind(&row.event.connector_id)
                    .push_bind(&row.event.message)
                    .push_bind(&row.event.severity)
                    .push_bind(&row.event.host)
                    .push_bind(&row.event.source_ip)
                    .push_bind(&row.event.service)
                    .push_bind(&row.event.facility)
                    .push_bind(&row.event.program)
                    .push_bind(&row.event.trace_id)
                    .push_bind(&row.event.span_id)
                    .push_bind(payload)
                    .push_bind(&row.normalized_hash)
                    .push_bind(&row.event.external_id)
                    .push_bind(&row.template_id);
            });
            builder.push(" ON CONFLICT (normalized_hash, timestamp) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Park unmatched events for source discovery. Fire-and-forget: a full
    /// or failing buffer never fails the ingest request.
    async fn buffer_for_discovery(&self, unmatched: Vec<NormalizedEvent>) {
        let discovery = self.config_service.discovery_config().await;
        if !discovery.enabled {
            return;
        }

        let pool = self.pool.clone();
        tokio::spawn(async move {
            for event in unmatched {
                let sample: String = event.message.chars().take(DISCOVERY_SAMPLE_LEN).collect();
                let result = sqlx::query(
                    "INSERT INTO discovery_buffer \
                     (host, source_ip, program, facility, severity, message_sample, received_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&event.host)
                .bind(&event.source_ip)
                .bind(&event.program)
                .bind(&event.facility)
                .bind(&event.severity)
                .bind(sample)
                .bind(event.received_at)
                .execute(&pool)
                .await;

                if let Err(e) = result {
                    tracing::warn!("Discovery buffer insert failed: {}", e);
                    break;
                }
            }
        });
    }

    /// The compiled redactor for the currently configured pattern list,
    /// rebuilt only when the list changes.
    async fn current_redactor(&self) -> Arc<Redactor> {
        let patterns = self.config_service.redaction_patterns().await;
        let mut guard = self.redactor.lock().expect("redactor lock poisoned");
        if !guard.is_current(&patterns) {
            tracing::info!("Recompiling redaction rules ({} user patterns)", patterns.len());
            *guard = Arc::new(Redactor::new(&patterns));
        }
        Arc::clone(&guard)
    }
}

/// The three accepted body shapes: {events: [...]}, a bare array, or a
/// single object carrying message/msg.
fn parse_body(body: serde_json::Value) -> ApiResult<Vec<RawEntry>> {
    match body {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::Array(items)) = map.get("events") {
                return collect_entries(items.clone());
            }
            if map.contains_key("message") || map.contains_key("msg") {
                return Ok(vec![map]);
            }
            Err(ApiError::validation_error(
                "Body must be {events: [...]}, an array, or a single event object",
            ))
        },
        serde_json::Value::Array(items) => collect_entries(items),
        _ => Err(ApiError::validation_error("Body must be a JSON object or array")),
    }
}

fn collect_entries(items: Vec<serde_json::Value>) -> ApiResult<Vec<RawEntry>> {
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::Object(map) => entries.push(map),
            // Bare strings are tolerated as message-only entries
            serde_json::Value::String(s) => {
                let mut map = RawEntry::new();
                map.insert("message".to_string(), serde_json::Value::String(s));
                entries.push(map);
            },
            _ => {},
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_shapes() {
        let wrapped = serde_json::json!({"events": [{"message": "a"}, {"message": "b"}]});
        assert_eq!(parse_body(wrapped).unwrap().len(), 2);

        let bare = serde_json::json!([{"message": "a"}]);
        assert_eq!(parse_body(bare).unwrap().len(), 1);

        let single = serde_json::json!({"msg": "hello"});
        assert_eq!(parse_body(single).unwrap().len(), 1);

        let invalid = serde_json::json!({"foo": "bar"});
        assert!(parse_body(invalid).is_err());

        let scalar = serde_json::json!(42);
        assert!(parse_body(scalar).is_err());
    }
}
