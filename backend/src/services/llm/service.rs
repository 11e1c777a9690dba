//! LLM Service Trait and Implementation
//!
//! The single seam between the pipeline and the LLM provider. The pipeline
//! depends on the trait so tests can substitute a scripted implementation.

use async_trait::async_trait;

use super::client::LlmClient;
use super::models::*;

/// Options for one scoring call. The system prompt arrives fully assembled
/// (base + criterion guidelines) from the scoring job.
#[derive(Debug, Clone, Default)]
pub struct ScoreOptions {
    pub system_prompt: String,
}

/// Options for one meta-analysis call.
#[derive(Debug, Clone, Default)]
pub struct MetaOptions {
    pub system_prompt: String,
    pub model_override: Option<String>,
}

/// The LLM operations the pipeline needs.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Score a batch of events; returns one CriterionScores per input event.
    async fn score_events(
        &self,
        config: &AiConfig,
        events: &[ScoreEventLine],
        system_description: &str,
        source_labels: &[String],
        opts: &ScoreOptions,
    ) -> Result<(Vec<CriterionScores>, LlmUsage), LlmError>;

    /// Analyze one window of deduplicated events against its context.
    async fn meta_analyze(
        &self,
        config: &AiConfig,
        events: &[MetaEventLine],
        system_description: &str,
        source_labels: &[String],
        context: &MetaContext,
        opts: &MetaOptions,
    ) -> Result<(MetaAnalyzeResponse, LlmUsage), LlmError>;
}

/// Production implementation backed by the chat-completions client.
pub struct LlmServiceImpl {
    client: LlmClient,
}

impl Default for LlmServiceImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmServiceImpl {
    pub fn new() -> Self {
        Self { client: LlmClient::new() }
    }
}

#[async_trait]
impl LlmService for LlmServiceImpl {
    async fn score_events(
        &self,
        config: &AiConfig,
        events: &[ScoreEventLine],
        system_description: &str,
        source_labels: &[String],
        opts: &ScoreOptions,
    ) -> Result<(Vec<CriterionScores>, LlmUsage), LlmError> {
        let user_prompt = serde_json::to_string_pretty(&serde_json::json!({
            "system_description": system_description,
            "source_labels": source_labels,
            "events": events,
        }))?;

        let model = config.scoring_model().to_string();
        let (value, input_tokens, output_tokens) = self
            .client
            .chat_completion_json(config, &model, &opts.system_prompt, &user_prompt)
            .await?;

        let scores = parse_score_list(&value, events.len())?;

        let usage =
            LlmUsage { model, input_tokens, output_tokens, request_count: 1 };
        Ok((scores, usage))
    }

    async fn meta_analyze(
        &self,
        config: &AiConfig,
        events: &[MetaEventLine],
        system_description: &str,
        source_labels: &[String],
        context: &MetaContext,
        opts: &MetaOptions,
    ) -> Result<(MetaAnalyzeResponse, LlmUsage), LlmError> {
        let user_prompt = serde_json::to_string_pretty(&serde_json::json!({
            "system_description": system_description,
            "source_labels": source_labels,
            "events": events,
            "previous_summaries": context.previous_summaries,
            "tracked_findings": context.open_findings,
        }))?;

        let model = opts
            .model_override
            .clone()
            .unwrap_or_else(|| config.meta_model().to_string());
        let (value, input_tokens, output_tokens) = self
            .client
            .chat_completion_json(config, &model, &opts.system_prompt, &user_prompt)
            .await?;

        let mut response: MetaAnalyzeResponse = serde_json::from_value(value)
            .map_err(|e| LlmError::ParseError(format!("Unexpected meta response shape: {}", e)))?;
        response.meta_scores = response.meta_scores.clamped();

        let usage =
            LlmUsage { model, input_tokens, output_tokens, request_count: 1 };
        Ok((response, usage))
    }
}

/// Extract the score list from a response that may be `{scores: [...]}` or a
/// bare array. The list is padded/truncated to `expected` entries so one
/// miscounted response cannot desynchronize the batch.
fn parse_score_list(
    value: &serde_json::Value,
    expected: usize,
) -> Result<Vec<CriterionScores>, LlmError> {
    let array = match value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => map
            .get("scores")
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                LlmError::ParseError("Response object has no 'scores' array".to_string())
            })?,
        _ => {
            return Err(LlmError::ParseError(
                "Response is neither an array nor an object".to_string(),
            ));
        },
    };

    let mut scores: Vec<CriterionScores> = array
        .iter()
        .map(|item| {
            serde_json::from_value::<CriterionScores>(item.clone())
                .unwrap_or_default()
                .clamped()
        })
        .collect();

    if scores.len() != expected {
        tracing::warn!(
            "LLM returned {} score entries for {} events; padding/truncating",
            scores.len(),
            expected
        );
        scores.resize(expected, CriterionScores::default());
    }

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score_list_wrapped() {
        let value = serde_json::json!({"scores": [{"anomaly": 0.5}, {"it_security": 1.4}]});
        let scores = parse_score_list(&value, 2).unwrap();
        assert_eq!(scores[0].anomaly, 0.5);
        // Out-of-range values are clamped
        assert_eq!(scores[1].it_security, 1.0);
    }

    #[test]
    fn test_parse_score_list_bare_array_padded() {
        let value = serde_json::json!([{"anomaly": 0.2}]);
        let scores = parse_score_list(&value, 3).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[1].is_all_zero());
    }

    #[test]
    fn test_parse_score_list_truncates_extra() {
        let value = serde_json::json!([{}, {}, {}]);
        let scores = parse_score_list(&value, 1).unwrap();
        assert_eq!(scores.len(), 1);
    }
}
