//! Scoring job: select unscored events, consult the LLM per system, and
//! persist one score row per criterion per event.
//!
//! Template-matching events score zero without an LLM call; the remaining
//! events are deduplicated by their parameterized-message template id and
//! only one representative per template is sent out. An LLM failure
//! degrades to all-zero scores so no event is re-queued forever.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{CRITERIA, Event, MonitoredSystem};
use crate::services::app_config_service::AppConfigService;
use crate::services::llm::{
    AiConfig, CriterionScores, LlmService, LlmUsage, ScoreEventLine, ScoreOptions,
    build_scoring_prompt,
};
use crate::services::privacy::PrivacyFilter;
use crate::services::template_service::TemplateService;
use crate::utils::ApiResult;

pub struct ScoringService {
    pool: SqlitePool,
    config_service: Arc<AppConfigService>,
    template_service: Arc<TemplateService>,
    llm: Arc<dyn LlmService>,
}

impl ScoringService {
    pub fn new(
        pool: SqlitePool,
        config_service: Arc<AppConfigService>,
        template_service: Arc<TemplateService>,
        llm: Arc<dyn LlmService>,
    ) -> Self {
        Self { pool, config_service, template_service, llm }
    }

    /// Run one scoring pass. Returns the number of events that received
    /// scores.
    pub async fn run(&self, ai_config: &AiConfig) -> ApiResult<usize> {
        let pipeline_config = self.config_service.pipeline_config().await;
        let limit = pipeline_config.scoring_limit_per_run;

        let unscored: Vec<Event> = sqlx::query_as(
            "SELECT e.* FROM events e \
             WHERE e.system_id IS NOT NULL \
               AND NOT EXISTS (SELECT 1 FROM event_scores s \
                               WHERE s.event_id = e.id AND s.score_type = 'event') \
             ORDER BY e.timestamp ASC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if unscored.is_empty() {
            return Ok(0);
        }

        let mut by_system: HashMap<i64, Vec<Event>> = HashMap::new();
        for event in unscored {
            if let Some(system_id) = event.system_id {
                by_system.entry(system_id).or_default().push(event);
            }
        }

        let system_prompt = self.build_system_prompt().await;
        let privacy = PrivacyFilter::new(self.config_service.privacy_config().await);

        let mut scored_total = 0usize;
        for (system_id, events) in by_system {
            match self
                .score_system(ai_config, system_id, events, &system_prompt, &privacy)
                .await
            {
                Ok(count) => scored_total += count,
                Err(e) => {
                    // Component boundary: one system failing must not stop
                    // the others.
                    tracing::error!("Scoring failed for system {}: {}", system_id, e);
                },
            }
        }

        Ok(scored_total)
    }

    async fn build_system_prompt(&self) -> String {
        let custom = self.config_service.scoring_system_prompt().await;
        let mut overrides = HashMap::new();
        for criterion in CRITERIA {
            if let Some(guide) = self.config_service.criterion_guide(criterion.slug).await {
                overrides.insert(criterion.slug.to_string(), guide);
            }
        }
        build_scoring_prompt(custom.as_deref(), &overrides)
    }

    async fn score_system(
        &self,
        ai_config: &AiConfig,
        system_id: i64,
        events: Vec<Event>,
        system_prompt: &str,
        privacy: &PrivacyFilter,
    ) -> ApiResult<usize> {
        let system: Option<MonitoredSystem> =
            sqlx::query_as("SELECT * FROM monitored_systems WHERE id = ?")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(system) = system else {
            tracing::warn!("Skipping scoring for vanished system {}", system_id);
            return Ok(0);
        };

        let source_labels: Vec<String> =
            sqlx::query_scalar("SELECT label FROM log_sources WHERE system_id = ? ORDER BY id")
                .bind(system_id)
                .fetch_all(&self.pool)
                .await?;

        let templates = self.template_service.compiled_templates().await?;

        // Template matches are routine: zero scores, no LLM tokens.
        let (routine, to_score): (Vec<Event>, Vec<Event>) = events.into_iter().partition(|e| {
            templates.iter().any(|t| {
                t.matches(e.system_id, &e.message, e.host.as_deref(), e.program.as_deref())
            })
        });

        let mut written = 0usize;
        if !routine.is_empty() {
            self.persist_scores(routine.iter().map(|e| (e.id.clone(), CriterionScores::default())))
                .await?;
            written += routine.len();
        }

        if to_score.is_empty() {
            return Ok(written);
        }

        // One representative per message template; scores propagate to the
        // whole group afterwards. First-occurrence order keeps the batch
        // deterministic.
        let mut group_order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&Event>> = HashMap::new();
        for event in &to_score {
            let key = event
                .template_id
                .clone()
                .unwrap_or_else(|| event.id.clone());
            if !groups.contains_key(&key) {
                group_order.push(key.clone());
            }
            groups.entry(key).or_default().push(event);
        }

        let mut representatives: Vec<&Event> = Vec::with_capacity(groups.len());
        let mut group_of: Vec<&Vec<&Event>> = Vec::with_capacity(groups.len());
        for key in &group_order {
            let members = &groups[key];
            representatives.push(members[0]);
            group_of.push(members);
        }

        let lines: Vec<ScoreEventLine> = representatives
            .iter()
            .enumerate()
            .map(|(index, event)| ScoreEventLine {
                index,
                message: privacy.apply(&event.message),
                severity: event.severity.clone(),
                host: privacy.host_for_llm(event.host.as_deref()),
                program: privacy.program_for_llm(event.program.as_deref()),
            })
            .collect();

        let description = system.description.clone().unwrap_or_default();
        let opts = ScoreOptions { system_prompt: system_prompt.to_string() };

        let (scores, usage) = match self
            .llm
            .score_events(ai_config, &lines, &description, &source_labels, &opts)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    "LLM scoring failed for system {} ({} events): {} - emitting zero scores",
                    system_id,
                    to_score.len(),
                    e
                );
                (vec![CriterionScores::default(); lines.len()], LlmUsage::default())
            },
        };

        if usage.request_count > 0 {
            self.record_usage("scoring", &usage).await;
        }

        // Propagate representative scores to every group member.
        let mut rows: Vec<(String, CriterionScores)> = Vec::with_capacity(to_score.len());
        for (i, members) in group_of.iter().enumerate() {
            let score = scores.get(i).copied().unwrap_or_default();
            for member in members.iter() {
                rows.push((member.id.clone(), score));
            }
        }
        written += rows.len();
        self.persist_scores(rows.into_iter()).await?;

        tracing::info!(
            "Scored {} events ({} templates) for system {}",
            written,
            representatives.len(),
            system_id
        );
        Ok(written)
    }

    async fn persist_scores(
        &self,
        rows: impl Iterator<Item = (String, CriterionScores)>,
    ) -> ApiResult<()> {
        let rows: Vec<(String, CriterionScores)> = rows.collect();
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(100) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO event_scores (event_id, criterion_id, score_type, score) ",
            );
            builder.push_values(
                chunk.iter().flat_map(|(event_id, scores)| {
                    CRITERIA
                        .iter()
                        .map(move |criterion| (event_id, criterion.id, scores.get(criterion.slug)))
                }),
                |mut b, (event_id, criterion_id, score)| {
                    b.push_bind(event_id)
                        .push_bind(criterion_id)
                        .push_bind("event")
                        .push_bind(score);
                },
            );
            builder.push(" ON CONFLICT (event_id, criterion_id, score_type) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_usage(&self, task: &str, usage: &LlmUsage) {
        let result = sqlx::query(
            "INSERT INTO llm_usage (task, model, input_tokens, output_tokens, request_count, \
             estimated_cost_usd) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task)
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
