//! SSE score stream: an init payload on connect, then every 15 seconds
//! either the meta results of the last 30 seconds or a heartbeat comment.
//! The poll loop ends when the client disconnects and axum drops the
//! stream.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const UPDATE_LOOKBACK_SECS: i64 = 30;

pub async fn scores_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init_payload = match state.system_service.list().await {
        Ok(systems) => {
            let systems: Vec<serde_json::Value> = systems
                .iter()
                .map(|s| serde_json::json!({"id": s.id, "name": s.name}))
                .collect();
            serde_json::json!({"type": "init", "systems": systems})
        },
        Err(e) => {
            tracing::warn!("SSE init query failed: {}", e);
            serde_json::json!({"type": "init", "systems": []})
        },
    };

    let init = futures::stream::once(async move {
        Ok(Event::default().data(init_payload.to_string()))
    });

    let updates = futures::stream::unfold(state, |state| async move {
        tokio::time::sleep(POLL_INTERVAL).await;

        let since = Utc::now() - chrono::Duration::seconds(UPDATE_LOOKBACK_SECS);
        let event = match state.dashboard_service.meta_results_since(since).await {
            Ok(results) if !results.is_empty() => {
                let payload = serde_json::json!({"type": "update", "results": results});
                Event::default().data(payload.to_string())
            },
            Ok(_) => Event::default().comment("heartbeat"),
            Err(e) => {
                tracing::warn!("SSE poll failed: {}", e);
                Event::default().comment("heartbeat")
            },
        };

        Some((Ok(event), state))
    });

    Sse::new(futures::StreamExt::chain(init, updates)).keep_alive(KeepAlive::default())
}
