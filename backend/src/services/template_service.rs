//! Normal-behavior template engine.
//!
//! Generates context-aware regexes from example messages, matches events
//! against enabled templates, and retroactively zeroes scores when a new
//! template is created. Generation replaces every recognized variable span
//! (UUIDs, addresses, interface names, counters...) with a targeted regex
//! fragment, never a `.*` wildcard; the remaining literals are escaped and
//! the result anchored.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use validator::Validate;

use crate::models::{
    CreateTemplateRequest, NormalBehaviorTemplate, PreviewTemplateRequest,
    PreviewTemplateResponse, UpdateTemplateRequest,
};
use crate::utils::{ApiError, ApiResult};

// ----------------------------------------------------------------------
// Pattern generation
// ----------------------------------------------------------------------

enum Fragment {
    /// Same regex fragment for every match of the rule
    Fixed(&'static str),
    /// Fragment derived from the matched text (first capture = kept literal)
    KeepPrefix(&'static str),
}

struct GenRule {
    regex: &'static Lazy<Regex>,
    fragment: Fragment,
}

macro_rules! gen_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> =
            Lazy::new(|| Regex::new($pattern).expect("builtin generation rule must compile"));
    };
}

gen_regex!(
    G_UUID,
    r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"
);
gen_regex!(G_MAC_COLON, r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b");
gen_regex!(G_MAC_DOT, r"\b(?:[0-9A-Fa-f]{4}\.){2}[0-9A-Fa-f]{4}\b");
gen_regex!(G_IPV4, r"\b\d{1,3}(?:\.\d{1,3}){3}(?:/\d{1,2})?\b");
gen_regex!(G_IPV6, r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{0,4}\b");
gen_regex!(
    G_IFACE,
    r"\b(GigabitEthernet|TenGigabitEthernet|FastEthernet|Ethernet|HundredGigE|FortyGigE|ge-|xe-|et-|eth|ens|enp|veth|wlan|bond|docker|br-?)\d+(?:[/:.-]\d+)*\b"
);
gen_regex!(G_PORTCHANNEL, r"\b(Port-channel|Vlan|Loopback|Tunnel)\s?\d+\b");
gen_regex!(G_UNIT, r"\b(Switch|Stack|Unit|Slot|Module|Member|Node)\s?\d+\b");
gen_regex!(G_STP, r"\b(MSTI|MST|STP)\s?\d+\b");
gen_regex!(G_HEX0X, r"\b0x[0-9a-fA-F]+\b");
gen_regex!(G_LONGHEX, r"\b[0-9a-fA-F]{8,}\b");
gen_regex!(G_PATH, r"(?:/[\w][\w.-]*){2,}/?");
gen_regex!(G_DQUOTED, r#""[^"]*""#);
gen_regex!(G_SQUOTED, r"'[^']*'");
gen_regex!(G_UNDERSCORE_NUM, r"_\d+\b");
gen_regex!(G_NUM, r"\d+");

/// Ordered replacement rules: specific shapes first so the bare-number rule
/// cannot eat an IP octet.
static GEN_RULES: Lazy<Vec<GenRule>> = Lazy::new(|| {
    vec![
        GenRule {
            regex: &G_UUID,
            fragment: Fragment::Fixed(
                r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            ),
        },
        GenRule {
            regex: &G_MAC_COLON,
            fragment: Fragment::Fixed(r"(?:[0-9a-f]{2}[:-]){5}[0-9a-f]{2}"),
        },
        GenRule {
            regex: &G_MAC_DOT,
            fragment: Fragment::Fixed(r"(?:[0-9a-f]{4}\.){2}[0-9a-f]{4}"),
        },
        GenRule {
            regex: &G_IPV4,
            fragment: Fragment::Fixed(
                r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?:/\d{1,2})?",
            ),
        },
        GenRule { regex: &G_IPV6, fragment: Fragment::Fixed(r"[0-9a-f:]{3,}") },
        GenRule { regex: &G_IFACE, fragment: Fragment::KeepPrefix(r"\d+(?:[/:.-]\d+)*") },
        GenRule { regex: &G_PORTCHANNEL, fragment: Fragment::KeepPrefix(r"\s?\d+") },
        GenRule { regex: &G_UNIT, fragment: Fragment::KeepPrefix(r"\s?\d+") },
        GenRule { regex: &G_STP, fragment: Fragment::KeepPrefix(r"\s?\d+") },
        GenRule { regex: &G_HEX0X, fragment: Fragment::Fixed(r"0x[0-9a-f]+") },
        GenRule { regex: &G_LONGHEX, fragment: Fragment::Fixed(r"[0-9a-f]{8,}") },
        GenRule { regex: &G_PATH, fragment: Fragment::Fixed(r"(?:/[\w][\w.-]*)+/?") },
        GenRule { regex: &G_DQUOTED, fragment: Fragment::Fixed(r#""[^"]*""#) },
        GenRule { regex: &G_SQUOTED, fragment: Fragment::Fixed(r"'[^']*'") },
        GenRule { regex: &G_UNDERSCORE_NUM, fragment: Fragment::Fixed(r"_\d+") },
        GenRule { regex: &G_NUM, fragment: Fragment::Fixed(r"\d+") },
    ]
});

enum Segment {
    Literal(String),
    Generated(String),
}

/// Generate an anchored, case-insensitive-ready message pattern from one
/// example message.
pub fn generate_pattern(example: &str) -> String {
    let mut segments = vec![Segment::Literal(example.to_string())];

    for rule in GEN_RULES.iter() {
        let mut next = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                Segment::Generated(g) => next.push(Segment::Generated(g)),
                Segment::Literal(text) => {
                    let mut cursor = 0;
                    for m in rule.regex.find_iter(&text) {
                        if m.start() > cursor {
                            next.push(Segment::Literal(text[cursor..m.start()].to_string()));
                        }
                        let generated = match &rule.fragment {
                            Fragment::Fixed(f) => (*f).to_string(),
                            Fragment::KeepPrefix(suffix) => {
                                let caps = rule
                                    .regex
                                    .captures(m.as_str())
                                    .expect("find_iter match must capture");
                                format!("{}{}", regex::escape(&caps[1]), suffix)
                            },
                        };
                        next.push(Segment::Generated(generated));
                        cursor = m.end();
                    }
                    if cursor < text.len() {
                        next.push(Segment::Literal(text[cursor..].to_string()));
                    }
                },
            }
        }
        segments = next;
    }

    let body: String = segments
        .iter()
        .map(|s| match s {
            Segment::Literal(l) => regex::escape(l),
            Segment::Generated(g) => g.clone(),
        })
        .collect();

    format!("^{}$", body)
}

/// Convert a legacy `*` glob into an anchored regex. Anything already
/// anchored is taken as a real regex and passed through.
pub fn convert_legacy_pattern(pattern: &str) -> String {
    if pattern.starts_with('^') {
        return pattern.to_string();
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{}$", body)
}

// ----------------------------------------------------------------------
// Compiled matching
// ----------------------------------------------------------------------

pub struct CompiledTemplate {
    pub template: NormalBehaviorTemplate,
    message_re: Regex,
    host_re: Option<Regex>,
    program_re: Option<Regex>,
}

impl CompiledTemplate {
    fn compile(template: NormalBehaviorTemplate) -> Option<Self> {
        let pattern = convert_legacy_pattern(&template.pattern);
        let message_re = match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("Template {} has invalid pattern: {}", template.id, e);
                return None;
            },
        };
        let host_re = template.host_pattern.as_deref().and_then(|p| {
            Regex::new(&format!("(?i){}", p))
                .map_err(|e| tracing::warn!("Template {} host pattern invalid: {}", template.id, e))
                .ok()
        });
        let program_re = template.program_pattern.as_deref().and_then(|p| {
            Regex::new(&format!("(?i){}", p))
                .map_err(|e| {
                    tracing::warn!("Template {} program pattern invalid: {}", template.id, e)
                })
                .ok()
        });
        Some(Self { template, message_re, host_re, program_re })
    }

    /// Template applies iff scope, message, host and program all agree.
    pub fn matches(
        &self,
        system_id: Option<i64>,
        message: &str,
        host: Option<&str>,
        program: Option<&str>,
    ) -> bool {
        if let Some(scope) = self.template.system_id {
            if system_id != Some(scope) {
                return false;
            }
        }
        if !self.message_re.is_match(message) {
            return false;
        }
        if let Some(host_re) = &self.host_re {
            match host {
                Some(h) if host_re.is_match(h) => {},
                _ => return false,
            }
        }
        if let Some(program_re) = &self.program_re {
            match program {
                Some(p) if program_re.is_match(p) => {},
                _ => return false,
            }
        }
        true
    }
}

// ----------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------

pub struct TemplateService {
    pool: SqlitePool,
    compiled: Mutex<Option<Arc<Vec<CompiledTemplate>>>>,
}

impl TemplateService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, compiled: Mutex::new(None) }
    }

    /// Drop the compiled cache; the next read recompiles.
    pub fn invalidate(&self) {
        *self.compiled.lock().expect("template cache poisoned") = None;
    }

    /// Enabled templates, compiled, cached until the next CRUD write.
    pub async fn compiled_templates(&self) -> ApiResult<Arc<Vec<CompiledTemplate>>> {
        if let Some(cached) = self.compiled.lock().expect("template cache poisoned").as_ref() {
            return Ok(Arc::clone(cached));
        }

        let templates: Vec<NormalBehaviorTemplate> = sqlx::query_as(
            "SELECT * FROM normal_behavior_templates WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let compiled: Arc<Vec<CompiledTemplate>> =
            Arc::new(templates.into_iter().filter_map(CompiledTemplate::compile).collect());

        *self.compiled.lock().expect("template cache poisoned") = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    pub async fn list(&self) -> ApiResult<Vec<NormalBehaviorTemplate>> {
        let templates: Vec<NormalBehaviorTemplate> =
            sqlx::query_as("SELECT * FROM normal_behavior_templates ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(templates)
    }

    pub async fn get(&self, id: i64) -> ApiResult<NormalBehaviorTemplate> {
        let template: Option<NormalBehaviorTemplate> =
            sqlx::query_as("SELECT * FROM normal_behavior_templates WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        template.ok_or_else(|| ApiError::not_found("Template not found"))
    }

    pub async fn create(&self, req: CreateTemplateRequest) -> ApiResult<NormalBehaviorTemplate> {
        req.validate()
            .map_err(|e| ApiError::validation_error(e.to_string()))?;
        let pattern = match (&req.pattern, &req.example_message) {
            (Some(pattern), _) => {
                let converted = convert_legacy_pattern(pattern);
                Regex::new(&format!("(?i){}", converted))
                    .map_err(|e| ApiError::invalid_pattern(e.to_string()))?;
                converted
            },
            (None, Some(example)) => generate_pattern(example),
            (None, None) => {
                return Err(ApiError::validation_error(
                    "Provide either pattern or example_message",
                ));
            },
        };

        let host_pattern = req.host.as_deref().map(|h| format!("^{}$", regex::escape(h)));
        let program_pattern = req.program.as_deref().map(|p| format!("^{}$", regex::escape(p)));

        let result = sqlx::query(
            "INSERT INTO normal_behavior_templates \
             (system_id, pattern, host_pattern, program_pattern, example_message, enabled, notes) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(req.system_id)
        .bind(&pattern)
        .bind(&host_pattern)
        .bind(&program_pattern)
        .bind(&req.example_message)
        .bind(req.enabled)
        .bind(&req.notes)
        .execute(&self.pool)
        .await?;

        self.invalidate();
        self.get(result.last_insert_rowid()).await
    }

    pub async fn update(
        &self,
        id: i64,
        req: UpdateTemplateRequest,
    ) -> ApiResult<NormalBehaviorTemplate> {
        let existing = self.get(id).await?;

        let pattern = match req.pattern {
            Some(p) => {
                let converted = convert_legacy_pattern(&p);
                Regex::new(&format!("(?i){}", converted))
                    .map_err(|e| ApiError::invalid_pattern(e.to_string()))?;
                converted
            },
            None => existing.pattern,
        };

        sqlx::query(
            "UPDATE normal_behavior_templates \
             SET pattern = ?, host_pattern = ?, program_pattern = ?, notes = ?, enabled = ?, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(&pattern)
        .bind(req.host_pattern.or(existing.host_pattern))
        .bind(req.program_pattern.or(existing.program_pattern))
        .bind(req.notes.or(existing.notes))
        .bind(req.enabled.unwrap_or(existing.enabled))
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.invalidate();
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM normal_behavior_templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::not_found("Template not found"));
        }
        self.invalidate();
        Ok(())
    }

    /// Generate a pattern from the example and report what it would match
    /// over recent events, without persisting anything.
    pub async fn preview(
        &self,
        req: PreviewTemplateRequest,
        display_window_days: i64,
    ) -> ApiResult<PreviewTemplateResponse> {
        req.validate()
            .map_err(|e| ApiError::validation_error(e.to_string()))?;
        let pattern = generate_pattern(&req.example_message);
        let message_re = Regex::new(&format!("(?i){}", pattern))
            .map_err(|e| ApiError::invalid_pattern(e.to_string()))?;

        let host_pattern = req.host.as_deref().map(|h| format!("^{}$", regex::escape(h)));
        let program_pattern = req.program.as_deref().map(|p| format!("^{}$", regex::escape(p)));

        let since = chrono::Utc::now() - chrono::Duration::days(display_window_days);
        let rows: Vec<(String,)> = match req.system_id {
            Some(system_id) => {
                sqlx::query_as(
                    "SELECT message FROM events WHERE system_id = ? AND timestamp >= ? \
                     ORDER BY timestamp DESC LIMIT 5000",
                )
                .bind(system_id)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as(
                    "SELECT message FROM events WHERE timestamp >= ? \
                     ORDER BY timestamp DESC LIMIT 5000",
                )
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            },
        };

        let mut matching = 0i64;
        let mut samples = Vec::new();
        for (message,) in rows {
            if message_re.is_match(&message) {
                matching += 1;
                if samples.len() < 5 {
                    samples.push(message);
                }
            }
        }

        Ok(PreviewTemplateResponse {
            pattern,
            host_pattern,
            program_pattern,
            matching_events: matching,
            sample_matches: samples,
        })
    }

    /// Retroactively zero event scores for events matching the template over
    /// the display window. Returns the touched event ids; the caller runs
    /// the recalculation engine afterwards to refresh effective scores.
    pub async fn zero_matching_scores(
        &self,
        template: &NormalBehaviorTemplate,
        display_window_days: i64,
    ) -> ApiResult<Vec<String>> {
        let compiled = CompiledTemplate::compile(template.clone())
            .ok_or_else(|| ApiError::invalid_pattern("Template pattern does not compile"))?;

        let since = chrono::Utc::now() - chrono::Duration::days(display_window_days);
        let rows: Vec<(String, Option<i64>, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT id, system_id, message, host, program FROM events WHERE timestamp >= ?",
            )
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let matching_ids: Vec<String> = rows
            .into_iter()
            .filter(|(_, system_id, message, host, program)| {
                compiled.matches(*system_id, message, host.as_deref(), program.as_deref())
            })
            .map(|(id, ..)| id)
            .collect();

        if matching_ids.is_empty() {
            return Ok(matching_ids);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in matching_ids.chunks(500) {
            let mut builder =
                sqlx::QueryBuilder::new("UPDATE event_scores SET score = 0 WHERE event_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            builder.push(")");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(
            "Template {} retroactively zeroed scores of {} events",
            template.id,
            matching_ids.len()
        );
        Ok(matching_ids)
    }
}
