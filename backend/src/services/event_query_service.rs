//! Event read paths: search with filters and pagination, facets, trace
//! lookup, and the batched time-range acknowledge operations.
//!
//! Events are always returned with a deterministic secondary sort
//! (timestamp DESC, id ASC by default) so pagination never jitters.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{
    AckEventsRequest, AckEventsResponse, Event, EventFacets, EventPage, EventSearchParams,
    FacetBucket,
};
use crate::utils::{ApiError, ApiResult};

/// Closed set of sortable columns.
const SORTABLE: &[&str] = &["timestamp", "received_at", "severity", "host", "program"];

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const ACK_BATCH: i64 = 5000;

#[derive(Clone)]
pub struct EventQueryService {
    pool: SqlitePool,
}

impl EventQueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn search(&self, params: &EventSearchParams) -> ApiResult<EventPage> {
        let (where_sql, binds) = build_filters(params)?;

        let sort = match params.sort.as_deref() {
            None => "timestamp",
            Some(column) if SORTABLE.contains(&column) => column,
            Some(other) => {
                return Err(ApiError::validation_error(format!(
                    "Cannot sort on '{}'. Search failed. Check your query syntax.",
                    other
                )));
            },
        };
        let order = match params.order.as_deref() {
            Some("asc") => "ASC",
            Some("desc") | None => "DESC",
            Some(other) => {
                return Err(ApiError::validation_error(format!(
                    "Invalid sort order '{}'",
                    other
                )));
            },
        };

        let page = params.page.unwrap_or(1).max(1);
        let page_size = params
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * page_size;

        let count_sql = format!("SELECT COUNT(*) FROM events e {}", where_sql);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = count_query.bind_value(bind);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let select_sql = format!(
            "SELECT e.* FROM events e {} ORDER BY e.{} {}, e.id ASC LIMIT ? OFFSET ?",
            where_sql, sort, order
        );
        let mut select_query = sqlx::query_as::<_, Event>(&select_sql);
        for bind in &binds {
            select_query = select_query.bind_value(bind);
        }
        let events = select_query
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(EventPage { events, total, page, page_size })
    }

    pub async fn facets(&self, params: &EventSearchParams) -> ApiResult<EventFacets> {
        let (where_sql, binds) = build_filters(params)?;

        Ok(EventFacets {
            severity: self.facet_column("severity", &where_sql, &binds).await?,
            host: self.facet_column("host", &where_sql, &binds).await?,
            program: self.facet_column("program", &where_sql, &binds).await?,
            facility: self.facet_column("facility", &where_sql, &binds).await?,
        })
    }

    async fn facet_column(
        &self,
        column: &str,
        where_sql: &str,
        binds: &[BindValue],
    ) -> ApiResult<Vec<FacetBucket>> {
        let base = if where_sql.is_empty() { "WHERE 1=1" } else { where_sql };
        let sql = format!(
            "SELECT e.{col}, COUNT(*) AS n FROM events e {base} \
             AND e.{col} IS NOT NULL GROUP BY e.{col} ORDER BY n DESC LIMIT 20",
            col = column,
            base = base,
        );
        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        for bind in binds {
            query = query.bind_value(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(value, count)| FacetBucket { value, count })
            .collect())
    }

    pub async fn trace(&self, trace_id: &str) -> ApiResult<Vec<Event>> {
        let events: Vec<Event> = sqlx::query_as(
            "SELECT * FROM events WHERE trace_id = ? ORDER BY timestamp ASC, id ASC LIMIT 1000",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Page of one system's events (dashboard listing).
    pub async fn system_events(
        &self,
        system_id: i64,
        page: i64,
        page_size: i64,
    ) -> ApiResult<EventPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE system_id = ?")
            .bind(system_id)
            .fetch_one(&self.pool)
            .await?;

        let events: Vec<Event> = sqlx::query_as(
            "SELECT * FROM events WHERE system_id = ? \
             ORDER BY timestamp DESC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(system_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(EventPage { events, total, page, page_size })
    }

    /// Acknowledge events in a time range, in batches of 5000 rows.
    pub async fn acknowledge_range(&self, req: &AckEventsRequest) -> ApiResult<AckEventsResponse> {
        self.set_acknowledged(req, Some(Utc::now())).await
    }

    pub async fn unacknowledge_range(
        &self,
        req: &AckEventsRequest,
    ) -> ApiResult<AckEventsResponse> {
        self.set_acknowledged(req, None).await
    }

    async fn set_acknowledged(
        &self,
        req: &AckEventsRequest,
        value: Option<chrono::DateTime<Utc>>,
    ) -> ApiResult<AckEventsResponse> {
        if req.from_ts >= req.to_ts {
            return Err(ApiError::validation_error("from_ts must be before to_ts"));
        }

        let mut updated = 0u64;
        loop {
            // Batch through a rowid subquery; UPDATE ... LIMIT is not
            // universally available.
            let sql = match (req.system_id.is_some(), value.is_some()) {
                (true, true) => {
                    "UPDATE events SET acknowledged_at = ? WHERE rowid IN ( \
                     SELECT rowid FROM events WHERE timestamp >= ? AND timestamp < ? \
                     AND system_id = ? AND acknowledged_at IS NULL LIMIT ?)"
                },
                (false, true) => {
                    "UPDATE events SET acknowledged_at = ? WHERE rowid IN ( \
                     SELECT rowid FROM events WHERE timestamp >= ? AND timestamp < ? \
                     AND acknowledged_at IS NULL LIMIT ?)"
                },
                (true, false) => {
                    "UPDATE events SET acknowledged_at = NULL WHERE rowid IN ( \
                     SELECT rowid FROM events WHERE timestamp >= ? AND timestamp < ? \
                     AND system_id = ? AND acknowledged_at IS NOT NULL LIMIT ?)"
                },
                (false, false) => {
                    "UPDATE events SET acknowledged_at = NULL WHERE rowid IN ( \
                     SELECT rowid FROM events WHERE timestamp >= ? AND timestamp < ? \
                     AND acknowledged_at IS NOT NULL LIMIT ?)"
                },
            };

            let mut query = sqlx::query(sql);
            if let Some(ts) = value {
                query = query.bind(ts);
            }
            query = query.bind(req.from_ts).bind(req.to_ts);
            if let Some(system_id) = req.system_id {
                query = query.bind(system_id);
            }
            query = query.bind(ACK_BATCH);

            let result = query.execute(&self.pool).await?;
            updated += result.rows_affected();
            if result.rows_affected() < ACK_BATCH as u64 {
                break;
            }
        }

        tracing::info!(
            "{} {} events in [{}, {})",
            if value.is_some() { "Acknowledged" } else { "Unacknowledged" },
            updated,
            req.from_ts,
            req.to_ts
        );
        Ok(AckEventsResponse { updated })
    }
}

/// One positional bind of the dynamic filter SQL. Timestamps stay typed so
/// they are encoded exactly like the stored column values.
#[derive(Debug, Clone)]
enum BindValue {
    Text(String),
    Int(i64),
    Timestamp(chrono::DateTime<Utc>),
}

trait BindExt<'q>: Sized {
    fn bind_value(self, value: &BindValue) -> Self;
}

impl<'q, O> BindExt<'q>
    for sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>
{
    fn bind_value(self, value: &BindValue) -> Self {
        match value {
            BindValue::Text(s) => self.bind(s.clone()),
            BindValue::Int(i) => self.bind(*i),
            BindValue::Timestamp(ts) => self.bind(*ts),
        }
    }
}

impl<'q, O> BindExt<'q>
    for sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>
{
    fn bind_value(self, value: &BindValue) -> Self {
        match value {
            BindValue::Text(s) => self.bind(s.clone()),
            BindValue::Int(i) => self.bind(*i),
            BindValue::Timestamp(ts) => self.bind(*ts),
        }
    }
}

/// Shared WHERE-clause builder for search and facets. Returns the SQL and
/// the positional binds in order.
fn build_filters(params: &EventSearchParams) -> ApiResult<(String, Vec<BindValue>)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<BindValue> = Vec::new();

    if let Some(system_id) = params.system_id {
        clauses.push("e.system_id = ?".to_string());
        binds.push(BindValue::Int(system_id));
    }
    if let Some(from_ts) = params.from_ts {
        clauses.push("e.timestamp >= ?".to_string());
        binds.push(BindValue::Timestamp(from_ts));
    }
    if let Some(to_ts) = params.to_ts {
        clauses.push("e.timestamp < ?".to_string());
        binds.push(BindValue::Timestamp(to_ts));
    }
    if let Some(acknowledged) = params.acknowledged {
        if acknowledged {
            clauses.push("e.acknowledged_at IS NOT NULL".to_string());
        } else {
            clauses.push("e.acknowledged_at IS NULL".to_string());
        }
    }

    // Comma-separated multi-value filters.
    for (column, value) in [
        ("severity", &params.severity),
        ("host", &params.host),
        ("program", &params.program),
    ] {
        if let Some(raw) = value {
            let values: Vec<&str> =
                raw.split(',').map(str::trim).filter(|v| !v.is_empty()).collect();
            if !values.is_empty() {
                let placeholders = vec!["?"; values.len()].join(", ");
                clauses.push(format!("e.{} IN ({})", column, placeholders));
                binds.extend(values.into_iter().map(|v| BindValue::Text(v.to_string())));
            }
        }
    }

    if let Some(q) = params.q.as_deref().filter(|q| !q.trim().is_empty()) {
        if params.q_mode.as_deref() == Some("contains") {
            clauses.push("e.message LIKE ? ESCAPE '\\'".to_string());
            binds.push(BindValue::Text(format!("%{}%", escape_like(q))));
        } else {
            // Full-text flavor: every word must appear.
            for word in q.split_whitespace().take(10) {
                clauses.push("e.message LIKE ? ESCAPE '\\'".to_string());
                binds.push(BindValue::Text(format!("%{}%", escape_like(word))));
            }
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    Ok((where_sql, binds))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
