//! Window meta-analysis: context building, the LLM call, and the finding
//! lifecycle with its guardrails.
//!
//! One call processes one window. The flow degrades gracefully at every
//! stage: an empty window or an all-zero window writes a synthetic result
//! without spending tokens, an LLM failure writes zero effective scores and
//! leaves the window without a meta result, and every finding mutation is
//! protected by dedup, contradiction, self-reference and severity guards.
//! All persistence of one analysis happens in a single transaction.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{
    CRITERIA, EventAckMode, Finding, MetaAnalysisConfig, MonitoredSystem, ResolutionEvidence,
    STATUS_OPEN, TRIGGER_MANUAL, Window, canonical_severity, severity_rank,
};
use crate::services::app_config_service::AppConfigService;
use crate::services::finding_dedup::{
    TfIdfModel, criterion_compatible, fingerprint, jaccard, normalize_tokens,
};
use crate::services::llm::{
    AiConfig, ContextFinding, CriterionScores, DEFAULT_META_PROMPT, LlmService, LlmUsage,
    MetaAnalyzeResponse, MetaContext, MetaEventLine, MetaFindingCandidate, MetaOptions,
    ResolvedEntry,
};
use crate::services::privacy::PrivacyFilter;
use crate::services::template_service::TemplateService;
use crate::utils::{ApiResult, significant_words, overlap_ratio};

/// Evidence phrases that contradict a resolution claim.
const CONTRADICTION_PHRASES: &[&str] = &[
    "persists",
    "unresolved",
    "still active",
    "still failing",
    "continues to",
    "remains unresolved",
    "remains open",
    "failed",
    "failure",
    "connection refused",
    "confirms ongoing",
    "not resolved",
    "no evidence of resolution",
];

/// Severities that can never prove a resolution.
const ERROR_SEVERITIES: &[&str] =
    &["error", "err", "critical", "crit", "alert", "emergency", "emerg"];

const MAX_CONTEXT_FINDINGS: usize = 30;
const MAX_KEY_EVENT_IDS: usize = 20;
const O2_MIN_LINES: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct MetaRunOptions {
    pub exclude_acknowledged: bool,
    pub reset_context: bool,
}

/// One deduplicated, 1-indexed line presented to the LLM.
struct LineInfo {
    representative_id: String,
    message: String,
    severity: Option<String>,
    host: Option<String>,
    program: Option<String>,
    count: i64,
    max_score: f64,
}

struct EventLite {
    id: String,
    message: String,
    severity: Option<String>,
    host: Option<String>,
    program: Option<String>,
    template_id: Option<String>,
}

pub struct MetaAnalyzer {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
    template_service: Arc<TemplateService>,
    llm: Arc<dyn LlmService>,
}

impl MetaAnalyzer {
    pub fn new(
        pool: SqlitePool,
        config_service: Arc<AppConfigService>,
        template_service: Arc<TemplateService>,
        llm: Arc<dyn LlmService>,
    ) -> Self {
        Self { pool, config_service, template_service, llm }
    }

    /// Analyze one window. Returns true when a meta result exists afterwards
    /// (fresh or synthetic); false when the analysis was skipped or failed.
    pub async fn analyze_window(
        &self,
        window_id: i64,
        ai_config: &AiConfig,
        opts: &MetaRunOptions,
    ) -> ApiResult<bool> {
        // Step 1: idempotency - a window is analyzed exactly once.
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM meta_results WHERE window_id = ?")
                .bind(window_id)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            tracing::debug!("Window {} already analyzed, skipping", window_id);
            return Ok(true);
        }

        // Step 2: load window, system, sources and configuration.
        let window: Option<Window> = sqlx::query_as("SELECT * FROM windows WHERE id = ?")
            .bind(window_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(window) = window else {
            tracing::warn!("Window {} vanished before meta-analysis", window_id);
            return Ok(false);
        };

        let system: Option<MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems WHERE id = ?")
                .bind(window.system_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(system) = system else {
            tracing::warn!("System {} vanished before meta-analysis", window.system_id);
            return Ok(false);
        };

        let source_labels: Vec<String> =
            sqlx::query_scalar("SELECT label FROM log_sources WHERE system_id = ? ORDER BY id")
                .bind(system.id)
                .fetch_all(&self.pool)
                .await?;

        let meta_config = self.config_service.meta_analysis_config().await;
        let pipeline_config = self.config_service.pipeline_config().await;
        let ack_mode = self.config_service.event_ack_mode().await;
        let exclude_acked = opts.exclude_acknowledged || ack_mode == EventAckMode::Skip;

        // Step 3: events of the window, capped.
        let cap = if window.trigger_kind == TRIGGER_MANUAL {
            let dashboard = self.config_service.dashboard_config().await;
            meta_config.meta_max_events.min(dashboard.reeval_max_events)
        } else {
            meta_config.meta_max_events
        };

        let events = self.fetch_window_events(&window, exclude_acked, cap).await?;

        // Step 4: exclude normal behavior.
        let templates = self.template_service.compiled_templates().await?;
        let events: Vec<EventLite> = events
            .into_iter()
            .filter(|e| {
                !templates.iter().any(|t| {
                    t.matches(
                        Some(system.id),
                        &e.message,
                        e.host.as_deref(),
                        e.program.as_deref(),
                    )
                })
            })
            .collect();

        if events.is_empty() {
            self.persist_synthetic(
                &window,
                "No significant events in this window.",
                &pipeline_config.effective_score_meta_weight,
                false,
                &meta_config,
            )
            .await?;
            return Ok(true);
        }

        // Step 5: scores. O1: an all-zero window skips the LLM entirely.
        let score_by_event = self.fetch_scores(&events).await?;
        let all_zero = events
            .iter()
            .all(|e| score_by_event.get(&e.id).copied().unwrap_or(0.0) == 0.0);
        if all_zero {
            self.persist_synthetic(
                &window,
                "All events in this window scored zero on every criterion; routine activity.",
                &pipeline_config.effective_score_meta_weight,
                true,
                &meta_config,
            )
            .await?;
            return Ok(true);
        }

        // Step 6: group by template, keep representative and count.
        let mut lines = group_into_lines(&events, &score_by_event);

        // Step 7 (O2): beyond 5 lines, zero-score lines are dropped as long
        // as at least one non-zero line remains.
        if lines.len() > O2_MIN_LINES && lines.iter().any(|l| l.max_score > 0.0) {
            lines.retain(|l| l.max_score > 0.0);
        }

        // Step 9: optionally present the riskiest lines first.
        if meta_config.meta_prioritize_high_scores {
            lines.sort_by(|a, b| {
                b.max_score
                    .partial_cmp(&a.max_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        // Step 8: privacy filter - memory only, stored rows are untouched.
        let privacy = PrivacyFilter::new(self.config_service.privacy_config().await);
        let llm_lines: Vec<MetaEventLine> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| MetaEventLine {
                line: i + 1,
                message: privacy.apply(&line.message),
                severity: line.severity.clone(),
                host: privacy.host_for_llm(line.host.as_deref()),
                program: privacy.program_for_llm(line.program.as_deref()),
                count: line.count,
            })
            .collect();

        // Step 10: context of previous summaries and tracked findings.
        let mut previous_summaries = if opts.reset_context {
            vec![]
        } else {
            self.fetch_previous_summaries(&window, meta_config.context_window_count)
                .await?
        };

        let mut tracked = self.fetch_open_findings(system.id).await?;

        // Step 11: normal-behavior-aware context sanitation.
        let template_word_sets: Vec<HashSet<String>> = templates
            .iter()
            .filter(|t| t.template.system_id.is_none() || t.template.system_id == Some(system.id))
            .map(|t| {
                let text = t
                    .template
                    .example_message
                    .clone()
                    .unwrap_or_else(|| t.template.pattern.clone());
                significant_words(&text, 3)
            })
            .filter(|words| !words.is_empty())
            .collect();

        let mut auto_resolved_ids = Vec::new();
        tracked.retain(|finding| {
            let finding_words = significant_words(&finding.text, 3);
            let is_normal = template_word_sets
                .iter()
                .any(|tw| overlap_ratio(tw, &finding_words) >= 0.5);
            if is_normal && finding.status == STATUS_OPEN {
                auto_resolved_ids.push(finding.id);
                false
            } else {
                !is_normal
            }
        });
        for finding_id in &auto_resolved_ids {
            self.auto_resolve_normal(*finding_id).await?;
        }

        previous_summaries.retain(|summary| {
            let summary_words = significant_words(summary, 3);
            !template_word_sets
                .iter()
                .any(|tw| overlap_ratio(tw, &summary_words) >= 0.4)
        });

        if opts.exclude_acknowledged {
            let acked_word_sets = self.fetch_acked_word_sets(&window).await?;
            previous_summaries.retain(|summary| {
                let summary_words = significant_words(summary, 3);
                !acked_word_sets
                    .iter()
                    .any(|aw| overlap_ratio(aw, &summary_words) >= 0.3)
            });
        }

        let context_findings: Vec<ContextFinding> = tracked
            .iter()
            .take(MAX_CONTEXT_FINDINGS)
            .enumerate()
            .map(|(index, f)| ContextFinding {
                index,
                text: f.text.clone(),
                severity: f.severity.clone(),
                criterion: f.criterion_slug.clone(),
                status: f.status.clone(),
                created_at: f.created_at.to_rfc3339(),
                last_seen_at: f.last_seen_at.to_rfc3339(),
                occurrence_count: f.occurrence_count,
                db_id: f.id,
                fingerprint: f.fingerprint.clone(),
                consecutive_misses: f.consecutive_misses,
            })
            .collect();

        let context = MetaContext {
            previous_summaries,
            open_findings: context_findings,
        };

        // Step 12: the LLM call.
        let mut system_prompt = self
            .config_service
            .meta_system_prompt()
            .await
            .unwrap_or_else(|| DEFAULT_META_PROMPT.to_string());
        if let Some(ack_prompt) = self.config_service.event_ack_prompt().await {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&ack_prompt);
        }

        let meta_opts = MetaOptions { system_prompt, model_override: None };
        let description = system.description.clone().unwrap_or_default();

        let (response, usage) = match self
            .llm
            .meta_analyze(
                ai_config,
                &llm_lines,
                &description,
                &source_labels,
                &context,
                &meta_opts,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    "Meta-analysis LLM call failed for window {}: {} - writing zero scores",
                    window.id,
                    e
                );
                // Dependency failure: zero effective scores, no meta_results
                // row; the window stays and is never retried implicitly.
                let mut tx = self.pool.begin().await?;
                self.upsert_effective_scores(
                    &mut tx,
                    &window,
                    &CriterionScores::default(),
                    pipeline_config.effective_score_meta_weight,
                )
                .await?;
                tx.commit().await?;
                return Ok(false);
            },
        };

        // Steps 13-23 in one transaction.
        self.apply_analysis(
            &window,
            &system,
            &lines,
            &tracked,
            response,
            &meta_config,
            pipeline_config.effective_score_meta_weight,
        )
        .await?;

        self.record_usage(&usage).await;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Fetch helpers
    // ------------------------------------------------------------------

    async fn fetch_window_events(
        &self,
        window: &Window,
        exclude_acked: bool,
        cap: i64,
    ) -> ApiResult<Vec<EventLite>> {
        let sql = if exclude_acked {
            "SELECT id, message, severity, host, program, template_id FROM events \
             WHERE system_id = ? AND timestamp >= ? AND timestamp < ? \
               AND acknowledged_at IS NULL \
             ORDER BY timestamp ASC LIMIT ?"
        } else {
            "SELECT id, message, severity, host, program, template_id FROM events \
             WHERE system_id = ? AND timestamp >= ? AND timestamp < ? \
             ORDER BY timestamp ASC LIMIT ?"
        };

        let rows: Vec<(String, String, Option<String>, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(sql)
                .bind(window.system_id)
                .bind(window.from_ts)
                .bind(window.to_ts)
                .bind(cap)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, message, severity, host, program, template_id)| EventLite {
                id,
                message,
                severity,
                host,
                program,
                template_id,
            })
            .collect())
    }

    /// Max event score per event id across all criteria.
    async fn fetch_scores(&self, events: &[EventLite]) -> ApiResult<HashMap<String, f64>> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        for chunk in events.chunks(500) {
            let mut builder = sqlx::QueryBuilder::new(
                "SELECT event_id, MAX(score) FROM event_scores WHERE score_type = 'event' \
                 AND event_id IN (",
            );
            let mut separated = builder.separated(", ");
            for event in chunk {
                separated.push_bind(&event.id);
            }
            builder.push(") GROUP BY event_id");

            let rows: Vec<(String, f64)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await?;
            scores.extend(rows);
        }
        Ok(scores)
    }

    async fn fetch_previous_summaries(
        &self,
        window: &Window,
        count: i64,
    ) -> ApiResult<Vec<String>> {
        let summaries: Vec<String> = sqlx::query_scalar(
            "SELECT m.summary FROM meta_results m \
             JOIN windows w ON w.id = m.window_id \
             WHERE w.system_id = ? AND m.window_id != ? AND m.summary IS NOT NULL \
             ORDER BY m.created_at DESC LIMIT ?",
        )
        .bind(window.system_id)
        .bind(window.id)
        .bind(count.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(summaries)
    }

    async fn fetch_open_findings(&self, system_id: i64) -> ApiResult<Vec<Finding>> {
        let findings: Vec<Finding> = sqlx::query_as(
            "SELECT * FROM findings \
             WHERE system_id = ? AND status IN ('open', 'acknowledged') \
             ORDER BY created_at DESC, id DESC",
        )
        .bind(system_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(findings)
    }

    async fn fetch_acked_word_sets(&self, window: &Window) -> ApiResult<Vec<HashSet<String>>> {
        let messages: Vec<String> = sqlx::query_scalar(
            "SELECT message FROM events \
             WHERE system_id = ? AND timestamp >= ? AND timestamp < ? \
               AND acknowledged_at IS NOT NULL LIMIT 500",
        )
        .bind(window.system_id)
        .bind(window.from_ts)
        .bind(window.to_ts)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages
            .iter()
            .map(|m| significant_words(m, 3))
            .filter(|w| !w.is_empty())
            .collect())
    }

    // ------------------------------------------------------------------
    // Synthetic results (empty window, O1)
    // ------------------------------------------------------------------

    async fn persist_synthetic(
        &self,
        window: &Window,
        summary: &str,
        meta_weight: &f64,
        increment_misses: bool,
        _meta_config: &MetaAnalysisConfig,
    ) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        let meta_scores = serde_json::to_string(&CriterionScores::default())?;
        sqlx::query(
            "INSERT INTO meta_results (window_id, meta_scores, summary, findings, key_event_ids) \
             VALUES (?, ?, ?, '[]', '[]')",
        )
        .bind(window.id)
        .bind(meta_scores)
        .bind(summary)
        .execute(&mut *tx)
        .await?;

        self.upsert_effective_scores(&mut tx, window, &CriterionScores::default(), *meta_weight)
            .await?;

        if increment_misses {
            // O1 still counts as a window the findings were not seen in.
            sqlx::query(
                "UPDATE findings SET consecutive_misses = consecutive_misses + 1 \
                 WHERE system_id = ? AND status IN ('open', 'acknowledged')",
            )
            .bind(window.system_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!("Window {} closed with synthetic meta result", window.id);
        Ok(())
    }

    async fn auto_resolve_normal(&self, finding_id: i64) -> ApiResult<()> {
        let evidence = serde_json::to_string(&ResolutionEvidence {
            reason: Some("Event type marked as normal behavior by operator".to_string()),
            auto_resolved: Some(true),
            ..Default::default()
        })?;
        sqlx::query(
            "UPDATE findings SET status = 'resolved', resolved_at = CURRENT_TIMESTAMP, \
             resolution_evidence = ? WHERE id = ? AND status != 'resolved'",
        )
        .bind(evidence)
        .bind(finding_id)
        .execute(&self.pool)
        .await?;
        tracing::info!("Finding {} auto-resolved as operator-marked normal behavior", finding_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 13-23: apply the LLM's answer under guardrails
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn apply_analysis(
        &self,
        window: &Window,
        system: &MonitoredSystem,
        lines: &[LineInfo],
        tracked: &[Finding],
        response: MetaAnalyzeResponse,
        meta_config: &MetaAnalysisConfig,
        meta_weight: f64,
    ) -> ApiResult<()> {
        let now = Utc::now();
        let context_slice: Vec<&Finding> =
            tracked.iter().take(MAX_CONTEXT_FINDINGS).collect();

        // Step 13: dedup safety net over new_findings.
        let candidates = intra_batch_dedup(response.new_findings.clone());

        let corpus: Vec<Vec<String>> =
            tracked.iter().map(|f| normalize_tokens(&f.text)).collect();
        let tfidf = TfIdfModel::build(&corpus);

        let mut matched_ids: HashSet<i64> = HashSet::new();
        let mut updates: Vec<(i64, String)> = Vec::new(); // (finding id, candidate severity)
        let mut fresh: Vec<MetaFindingCandidate> = Vec::new();

        for candidate in candidates {
            let matched = find_duplicate(&candidate, tracked, &tfidf, meta_config.dedup_threshold);
            match matched {
                Some(finding_id) => {
                    matched_ids.insert(finding_id);
                    updates.push((finding_id, canonical_severity(&candidate.severity).to_string()));
                },
                None => fresh.push(candidate),
            }
        }

        // Insert cap: keep the highest severities.
        fresh.sort_by_key(|c| std::cmp::Reverse(severity_rank(canonical_severity(&c.severity))));
        fresh.truncate(meta_config.max_new_findings_per_window.max(0) as usize);

        // Step 14: recurring-issue detection against recently resolved.
        let recently_resolved = self
            .fetch_recently_resolved(system.id, meta_config.recurring_lookback_days)
            .await?;
        let fresh: Vec<MetaFindingCandidate> = fresh
            .into_iter()
            .map(|mut candidate| {
                if let Some(previous) =
                    find_recurring(&candidate, &recently_resolved, meta_config.dedup_threshold)
                {
                    candidate.text = format!(
                        "Recurring: {} (previously resolved {})",
                        candidate.text,
                        previous.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                candidate
            })
            .collect();

        // Event links are computed up front so the meta_results row can
        // carry the union.
        let linked: Vec<Vec<String>> = fresh
            .iter()
            .map(|candidate| link_key_events(&candidate.text, lines))
            .collect();
        let mut meta_key_ids: Vec<String> = Vec::new();
        for ids in &linked {
            for id in ids {
                if !meta_key_ids.contains(id) && meta_key_ids.len() < MAX_KEY_EVENT_IDS {
                    meta_key_ids.push(id.clone());
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        // Step 15: the meta_results row with the legacy flat findings array.
        let meta_scores_json = serde_json::to_string(&response.meta_scores)?;
        let findings_json = serde_json::to_string(&fresh)?;
        let meta_key_json = serde_json::to_string(&meta_key_ids)?;
        let insert = sqlx::query(
            "INSERT INTO meta_results \
             (window_id, meta_scores, summary, findings, recommended_action, key_event_ids) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(window.id)
        .bind(&meta_scores_json)
        .bind(&response.summary)
        .bind(&findings_json)
        .bind(&response.recommended_action)
        .bind(&meta_key_json)
        .execute(&mut *tx)
        .await?;
        let meta_result_id = insert.last_insert_rowid();

        // Step 16: insert new findings with fingerprints and linked events.
        let mut inserted_ids = Vec::new();
        for (candidate, key_event_ids) in fresh.iter().zip(&linked) {
            let finding_fingerprint = fingerprint(&candidate.text);
            let key_event_json = serde_json::to_string(key_event_ids)?;
            let severity = canonical_severity(&candidate.severity);
            let criterion = candidate
                .criterion
                .as_deref()
                .filter(|slug| CRITERIA.iter().any(|c| c.slug == *slug));

            let result = sqlx::query(
                "INSERT INTO findings \
                 (system_id, meta_result_id, text, severity, criterion_slug, status, fingerprint, \
                  occurrence_count, consecutive_misses, last_seen_at, key_event_ids, created_at) \
                 VALUES (?, ?, ?, ?, ?, 'open', ?, 1, 0, ?, ?, ?)",
            )
            .bind(system.id)
            .bind(meta_result_id)
            .bind(&candidate.text)
            .bind(severity)
            .bind(criterion)
            .bind(&finding_fingerprint)
            .bind(now)
            .bind(&key_event_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted_ids.push(result.last_insert_rowid());
        }

        // Step 17: apply dedup updates - occurrence, recency, upgrade-only
        // severity.
        for (finding_id, candidate_severity) in &updates {
            let current = tracked
                .iter()
                .find(|f| f.id == *finding_id)
                .map(|f| f.severity.clone())
                .unwrap_or_else(|| "info".to_string());
            let escalated = if severity_rank(candidate_severity) > severity_rank(&current) {
                candidate_severity.clone()
            } else {
                current
            };

            sqlx::query(
                "UPDATE findings SET occurrence_count = occurrence_count + 1, \
                 last_seen_at = ?, consecutive_misses = 0, severity = ? WHERE id = ?",
            )
            .bind(now)
            .bind(escalated)
            .bind(finding_id)
            .execute(&mut *tx)
            .await?;
        }

        // Step 18: resolutions with guardrails.
        let mut resolved_ids: HashSet<i64> = HashSet::new();
        let mut kept_active_ids: HashSet<i64> = HashSet::new();

        for entry in &response.resolved_indices {
            let (index, evidence, event_refs) = match entry {
                ResolvedEntry::Detailed { index, evidence, event_refs } => {
                    (*index, evidence.clone(), event_refs.clone())
                },
                // Legacy bare index: no evidence, always rejected below.
                ResolvedEntry::Bare(index) => (*index, String::new(), vec![]),
            };

            let Some(finding) = usize::try_from(index)
                .ok()
                .and_then(|i| context_slice.get(i).copied())
            else {
                tracing::warn!("Resolution index {} out of context range", index);
                continue;
            };

            match check_resolution_guards(finding, &evidence, &event_refs, lines) {
                Ok(event_ids) => {
                    let evidence_json = serde_json::to_string(&ResolutionEvidence {
                        text: Some(evidence.clone()),
                        event_ids,
                        ..Default::default()
                    })?;
                    sqlx::query(
                        "UPDATE findings SET status = 'resolved', resolved_at = ?, \
                         resolved_by_meta_id = ?, resolution_evidence = ? \
                         WHERE id = ? AND status != 'resolved'",
                    )
                    .bind(now)
                    .bind(meta_result_id)
                    .bind(evidence_json)
                    .bind(finding.id)
                    .execute(&mut *tx)
                    .await?;
                    resolved_ids.insert(finding.id);
                    tracing::info!("Finding {} resolved by window {}", finding.id, window.id);
                },
                Err(reason) => {
                    // A rejected resolution is evidence the issue was seen.
                    tracing::info!(
                        "Rejected resolution of finding {}: {}",
                        finding.id,
                        reason
                    );
                    sqlx::query(
                        "UPDATE findings SET consecutive_misses = 0, last_seen_at = ?, \
                         occurrence_count = occurrence_count + 1 WHERE id = ?",
                    )
                    .bind(now)
                    .bind(finding.id)
                    .execute(&mut *tx)
                    .await?;
                    kept_active_ids.insert(finding.id);
                },
            }
        }

        // Step 19: still-active confirmations.
        for index in &response.still_active_indices {
            let Some(finding) = usize::try_from(*index)
                .ok()
                .and_then(|i| context_slice.get(i).copied())
            else {
                continue;
            };
            if resolved_ids.contains(&finding.id) {
                continue;
            }
            sqlx::query(
                "UPDATE findings SET consecutive_misses = 0, last_seen_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(finding.id)
            .execute(&mut *tx)
            .await?;
            kept_active_ids.insert(finding.id);
        }

        // Steps 20-21: dormancy counting, unless the LLM failed to classify
        // anything at all.
        let llm_classified = !response.still_active_indices.is_empty()
            || !response.resolved_indices.is_empty();
        let had_open_context = context_slice.iter().any(|f| f.status == STATUS_OPEN);

        if !had_open_context || llm_classified {
            let mut touched: HashSet<i64> = HashSet::new();
            touched.extend(&matched_ids);
            touched.extend(&resolved_ids);
            touched.extend(&kept_active_ids);

            for finding in tracked {
                if touched.contains(&finding.id) {
                    continue;
                }
                sqlx::query(
                    "UPDATE findings SET consecutive_misses = consecutive_misses + 1 \
                     WHERE id = ? AND status IN ('open', 'acknowledged')",
                )
                .bind(finding.id)
                .execute(&mut *tx)
                .await?;
            }
        } else {
            tracing::warn!(
                "Window {}: LLM returned no classifications for open findings; \
                 skipping dormancy increment",
                window.id
            );
        }

        // Step 22: eviction when the open set outgrows its cap.
        self.evict_excess_findings(&mut tx, system.id, meta_config.max_open_findings_per_system)
            .await?;

        // Step 23: effective scores.
        self.upsert_effective_scores(&mut tx, window, &response.meta_scores, meta_weight)
            .await?;

        tx.commit().await?;

        tracing::info!(
            "Window {} analyzed: {} new findings, {} deduped, {} resolved",
            window.id,
            inserted_ids.len(),
            updates.len(),
            resolved_ids.len()
        );
        Ok(())
    }

    async fn fetch_recently_resolved(
        &self,
        system_id: i64,
        lookback_days: i64,
    ) -> ApiResult<Vec<Finding>> {
        let since = Utc::now() - chrono::Duration::days(lookback_days.max(0));
        let findings: Vec<Finding> = sqlx::query_as(
            "SELECT * FROM findings \
             WHERE system_id = ? AND status = 'resolved' AND resolved_at >= ? \
             ORDER BY resolved_at DESC",
        )
        .bind(system_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(findings)
    }

    async fn evict_excess_findings(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        system_id: i64,
        max_open: i64,
    ) -> ApiResult<()> {
        let open: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, severity, last_seen_at FROM findings \
             WHERE system_id = ? AND status = 'open'",
        )
        .bind(system_id)
        .fetch_all(&mut **tx)
        .await?;

        let excess = open.len() as i64 - max_open;
        if excess <= 0 {
            return Ok(());
        }

        let mut ranked = open;
        ranked.sort_by(|a, b| {
            severity_rank(&a.1)
                .cmp(&severity_rank(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let evidence = serde_json::to_string(&ResolutionEvidence {
            text: Some("Auto-closed: evicted due to open findings cap".to_string()),
            event_ids: vec![],
            ..Default::default()
        })?;

        for (finding_id, _, _) in ranked.into_iter().take(excess as usize) {
            sqlx::query(
                "UPDATE findings SET status = 'resolved', resolved_at = CURRENT_TIMESTAMP, \
                 resolution_evidence = ? WHERE id = ?",
            )
            .bind(&evidence)
            .bind(finding_id)
            .execute(&mut **tx)
            .await?;
            tracing::warn!("Finding {} evicted over open-findings cap", finding_id);
        }
        Ok(())
    }

    /// Upsert one effective_scores row per criterion. The meta contribution
    /// is voided when no event contributed a non-zero score.
    async fn upsert_effective_scores(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        window: &Window,
        meta_scores: &CriterionScores,
        meta_weight: f64,
    ) -> ApiResult<()> {
        for criterion in CRITERIA {
            let max_event_score: Option<f64> = sqlx::query_scalar(
                "SELECT MAX(s.score) FROM event_scores s \
                 JOIN events e ON e.id = s.event_id \
                 WHERE e.system_id = ? AND e.timestamp >= ? AND e.timestamp < ? \
                   AND e.acknowledged_at IS NULL \
                   AND s.criterion_id = ? AND s.score_type = 'event'",
            )
            .bind(window.system_id)
            .bind(window.from_ts)
            .bind(window.to_ts)
            .bind(criterion.id)
            .fetch_one(&mut **tx)
            .await?;

            let max_event_score = max_event_score.unwrap_or(0.0);
            let raw_meta = meta_scores.get(criterion.slug);
            let meta_effective = if max_event_score == 0.0 { 0.0 } else { raw_meta };
            let effective_value =
                meta_weight * meta_effective + (1.0 - meta_weight) * max_event_score;

            sqlx::query(
                "INSERT INTO effective_scores \
                 (window_id, system_id, criterion_id, effective_value, meta_score, \
                  max_event_score, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
                 ON CONFLICT (window_id, system_id, criterion_id) DO UPDATE SET \
                   effective_value = excluded.effective_value, \
                   meta_score = excluded.meta_score, \
                   max_event_score = excluded.max_event_score, \
                   updated_at = CURRENT_TIMESTAMP",
            )
            .bind(window.id)
            .bind(window.system_id)
            .bind(criterion.id)
            .bind(effective_value)
            .bind(meta_effective)
            .bind(max_event_score)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn record_usage(&self, usage: &LlmUsage) {
        if usage.request_count == 0 {
            return;
        }
        let result = sqlx::query(
            "INSERT INTO llm_usage (task, model, input_tokens, output_tokens, request_count, \
             estimated_cost_usd) VALUES ('meta_analysis', ?, ?, ?, ?, ?)",
        )
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.request_count)
        .bind(usage.estimated_cost_usd())
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to record llm_usage: {}", e);
        }
    }
}

// ----------------------------------------------------------------------
// Pure helpers (unit-tested below)
// ----------------------------------------------------------------------

fn group_into_lines(events: &[EventLite], scores: &HashMap<String, f64>) -> Vec<LineInfo> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, LineInfo> = HashMap::new();

    for event in events {
        let key = event.template_id.clone().unwrap_or_else(|| event.id.clone());
        let score = scores.get(&event.id).copied().unwrap_or(0.0);
        match groups.get_mut(&key) {
            Some(line) => {
                line.count += 1;
                if score > line.max_score {
                    line.max_score = score;
                }
            },
            None => {
                order.push(key.clone());
                groups.insert(
                    key,
                    LineInfo {
                        representative_id: event.id.clone(),
                        message: event.message.clone(),
                        severity: event.severity.clone(),
                        host: event.host.clone(),
                        program: event.program.clone(),
                        count: 1,
                        max_score: score,
                    },
                );
            },
        }
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Collapse near-duplicates inside one new_findings batch: Jaccard over
/// identical-criterion pairs, keeping the higher-severity text.
fn intra_batch_dedup(candidates: Vec<MetaFindingCandidate>) -> Vec<MetaFindingCandidate> {
    let mut kept: Vec<MetaFindingCandidate> = Vec::new();

    'outer: for candidate in candidates {
        for existing in kept.iter_mut() {
            let same_criterion = existing.criterion == candidate.criterion;
            if same_criterion && jaccard(&existing.text, &candidate.text) >= 0.6 {
                let existing_rank = severity_rank(canonical_severity(&existing.severity));
                let candidate_rank = severity_rank(canonical_severity(&candidate.severity));
                if candidate_rank > existing_rank {
                    *existing = candidate;
                }
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

/// Dedup order per candidate: fingerprint, TF-IDF cosine (corpus >= 3),
/// then Jaccard. Criterion compatibility gates all three.
fn find_duplicate(
    candidate: &MetaFindingCandidate,
    existing: &[Finding],
    tfidf: &TfIdfModel,
    threshold: f64,
) -> Option<i64> {
    let candidate_fp = fingerprint(&candidate.text);
    let candidate_criterion = candidate.criterion.as_deref();

    for finding in existing {
        if criterion_compatible(candidate_criterion, finding.criterion_slug.as_deref())
            && finding.fingerprint == candidate_fp
        {
            return Some(finding.id);
        }
    }

    if tfidf.usable() {
        let candidate_tokens = normalize_tokens(&candidate.text);
        let best = existing
            .iter()
            .filter(|f| criterion_compatible(candidate_criterion, f.criterion_slug.as_deref()))
            .map(|f| (f.id, tfidf.cosine(&candidate_tokens, &normalize_tokens(&f.text))))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((id, score)) = best {
            if score >= threshold {
                return Some(id);
            }
        }
    }

    existing
        .iter()
        .filter(|f| criterion_compatible(candidate_criterion, f.criterion_slug.as_deref()))
        .find(|f| jaccard(&candidate.text, &f.text) >= threshold)
        .map(|f| f.id)
}

/// A resolved finding matching the candidate marks it as recurring; the
/// previous finding stays resolved.
fn find_recurring(
    candidate: &MetaFindingCandidate,
    resolved: &[Finding],
    threshold: f64,
) -> Option<DateTime<Utc>> {
    let candidate_fp = fingerprint(&candidate.text);
    let candidate_criterion = candidate.criterion.as_deref();

    resolved
        .iter()
        .filter(|f| criterion_compatible(candidate_criterion, f.criterion_slug.as_deref()))
        .find(|f| f.fingerprint == candidate_fp || jaccard(&candidate.text, &f.text) >= threshold)
        .and_then(|f| f.resolved_at)
}

/// Link a finding to window events by significant-word overlap.
fn link_key_events(finding_text: &str, lines: &[LineInfo]) -> Vec<String> {
    let finding_words = significant_words(finding_text, 3);
    let mut ids = Vec::new();
    for line in lines {
        let event_words = significant_words(&line.message, 3);
        if overlap_ratio(&finding_words, &event_words) >= 0.3 {
            ids.push(line.representative_id.clone());
            if ids.len() >= MAX_KEY_EVENT_IDS {
                break;
            }
        }
    }
    ids
}

/// All three resolution guards. Returns the mapped event ids on success.
fn check_resolution_guards(
    finding: &Finding,
    evidence: &str,
    event_refs: &[i64],
    lines: &[LineInfo],
) -> Result<Vec<String>, String> {
    // Map line refs through the 1-indexed line table; drop unknown refs.
    let mut event_ids = Vec::new();
    let mut referenced: Vec<&LineInfo> = Vec::new();
    for line_ref in event_refs {
        let Some(line) = usize::try_from(*line_ref - 1)
            .ok()
            .and_then(|i| lines.get(i))
        else {
            continue;
        };
        event_ids.push(line.representative_id.clone());
        referenced.push(line);
    }
    if event_ids.is_empty() {
        return Err("no valid event references".to_string());
    }

    // Contradiction guard: the evidence text itself says the issue lives.
    let evidence_lower = evidence.to_lowercase();
    if let Some(phrase) = CONTRADICTION_PHRASES
        .iter()
        .find(|p| evidence_lower.contains(*p))
    {
        return Err(format!("evidence contradicts resolution ('{}')", phrase));
    }

    // Self-reference guard: proof events that merely restate the finding.
    let finding_words = significant_words(&finding.text, 4);
    let all_self_referencing = referenced.iter().all(|line| {
        let event_words = significant_words(&line.message, 4);
        let forward = overlap_ratio(&event_words, &finding_words);
        let backward = overlap_ratio(&finding_words, &event_words);
        forward >= 0.4 || backward >= 0.4
    });
    if all_self_referencing {
        return Err("referenced events restate the finding".to_string());
    }

    // Error-severity guard: error events never prove a resolution.
    let known: Vec<&str> = referenced
        .iter()
        .filter_map(|line| line.severity.as_deref())
        .collect();
    if !known.is_empty()
        && known
            .iter()
            .all(|s| ERROR_SEVERITIES.contains(&s.to_lowercase().as_str()))
    {
        return Err("all referenced events carry error severities".to_string());
    }

    Ok(event_ids)
}
