//! The real-time event stream: `GET /api/projects/{id}/events`.
//!
//! Sends `connected` first with the active runs, then hub events as they
//! arrive. Heartbeats keep intermediate proxies from closing idle
//! streams; the connection times out after an hour and clients reconnect.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Sse;
use axum::response::sse::{Event as SseEvent, KeepAlive};
use futures::Stream;
use serde::Deserialize;
use uuid::Uuid;

use ivy_core::error::CoreError;
use ivy_core::events::{Event, EventHub, LogSubscription};
use ivy_db::queries::agent_runs as run_db;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub user_id: Uuid,
    /// Comma-separated run ids, or `all`.
    pub subscribe_logs: Option<String>,
}

/// Unsubscribes when the stream is dropped, however it ends.
struct Cleanup {
    hub: Arc<EventHub>,
    conn_id: Uuid,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.conn_id);
    }
}

fn parse_log_subscription(raw: Option<&str>) -> Result<LogSubscription, ApiError> {
    match raw {
        None | Some("") => Ok(LogSubscription::Runs(HashSet::new())),
        Some("all") => Ok(LogSubscription::All),
        Some(csv) => {
            let ids = csv
                .split(',')
                .map(|part| part.trim().parse::<Uuid>())
                .collect::<Result<HashSet<_>, _>>()
                .map_err(|_| {
                    ApiError::from(CoreError::InvalidRequest(format!(
                        "subscribe_logs must be 'all' or a csv of run ids, got {csv:?}"
                    )))
                })?;
            Ok(LogSubscription::Runs(ids))
        }
    }
}

fn render(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.kind())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

pub async fn events(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let logs = parse_log_subscription(query.subscribe_logs.as_deref())?;

    let mut subscription = state
        .ctx
        .hub
        .subscribe(project_id, query.user_id, logs)
        .map_err(|err| match err {
            // The per-user connection cap surfaces as 429.
            CoreError::Conflict(msg) => ApiError::too_many_requests(msg),
            other => other.into(),
        })?;

    let active_runs = run_db::list_active_run_ids_for_project(&state.ctx.pool, project_id)
        .await
        .map_err(CoreError::Internal)?;

    let hub = Arc::clone(&state.ctx.hub);
    let conn_id = subscription.conn_id;
    let heartbeat = state.ctx.config.sse_heartbeat;
    let timeout = state.ctx.config.sse_connection_timeout;

    let stream = async_stream::stream! {
        let _cleanup = Cleanup { hub, conn_id };

        yield Ok(render(&Event::Connected {
            connection_id: conn_id,
            active_runs,
        }));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = subscription.rx.recv() => match event {
                    Some(event) => yield Ok(render(&event)),
                    None => break,
                },
                () = &mut deadline => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat)))
}
