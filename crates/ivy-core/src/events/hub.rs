//! The event hub: a per-project multiplexer with bounded, non-blocking
//! delivery.
//!
//! Publishing takes a short read lock to snapshot the project's subscriber
//! list, releases it, then delivers with `try_send`. A full channel drops
//! the event for that subscriber only. Log events are additionally filtered
//! by each subscriber's run-id subscription set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};

use super::Event;

/// Which `agent:log` events a subscriber receives.
#[derive(Debug, Clone)]
pub enum LogSubscription {
    /// Every run in the project.
    All,
    /// Only the listed run ids.
    Runs(HashSet<Uuid>),
}

impl LogSubscription {
    fn matches(&self, run_id: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::Runs(ids) => ids.contains(&run_id),
        }
    }
}

struct Subscriber {
    conn_id: Uuid,
    user_id: Uuid,
    tx: mpsc::Sender<Event>,
    log_filter: Arc<RwLock<LogSubscription>>,
}

/// A live subscription: the receive end plus the identifiers needed to
/// update the log filter or unsubscribe.
pub struct Subscription {
    pub conn_id: Uuid,
    pub project_id: Uuid,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Default)]
struct HubState {
    /// Subscribers per project.
    projects: HashMap<Uuid, Vec<Subscriber>>,
    /// Reverse index so filter updates and cleanup need only the conn id.
    connections: HashMap<Uuid, Uuid>,
}

/// In-process publish/subscribe fabric keyed by project id.
///
/// The hub exclusively owns the send ends of subscriber channels; dropping
/// a subscriber entry closes the channel and ends the receiver's stream.
pub struct EventHub {
    state: RwLock<HubState>,
    buffer: usize,
    max_per_user: usize,
}

impl EventHub {
    pub fn new(buffer: usize, max_per_user: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            buffer,
            max_per_user,
        }
    }

    /// Register a subscriber for a project's events.
    ///
    /// Returns `Conflict` when the user already holds the maximum number of
    /// connections for this project.
    pub fn subscribe(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        logs: LogSubscription,
    ) -> Result<Subscription> {
        let mut state = self.state.write().expect("event hub lock poisoned");

        let existing = state
            .projects
            .get(&project_id)
            .map(|subs| subs.iter().filter(|s| s.user_id == user_id).count())
            .unwrap_or(0);
        if existing >= self.max_per_user {
            return Err(CoreError::conflict(format!(
                "user {user_id} already has {existing} event connections for project {project_id}"
            )));
        }

        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);

        state.projects.entry(project_id).or_default().push(Subscriber {
            conn_id,
            user_id,
            tx,
            log_filter: Arc::new(RwLock::new(logs)),
        });
        state.connections.insert(conn_id, project_id);

        Ok(Subscription {
            conn_id,
            project_id,
            rx,
        })
    }

    /// Remove a subscriber and close its channel.
    ///
    /// Idempotent: unknown connection ids are ignored.
    pub fn unsubscribe(&self, conn_id: Uuid) {
        let mut state = self.state.write().expect("event hub lock poisoned");
        let Some(project_id) = state.connections.remove(&conn_id) else {
            return;
        };
        let now_empty = state.projects.get_mut(&project_id).is_some_and(|subs| {
            subs.retain(|s| s.conn_id != conn_id);
            subs.is_empty()
        });
        if now_empty {
            state.projects.remove(&project_id);
        }
    }

    /// Replace a subscriber's log-run filter at runtime.
    pub fn update_log_subscriptions(&self, conn_id: Uuid, runs: LogSubscription) -> Result<()> {
        let state = self.state.read().expect("event hub lock poisoned");
        let Some(project_id) = state.connections.get(&conn_id) else {
            return Err(CoreError::not_found(format!("connection {conn_id}")));
        };
        let subscriber = state
            .projects
            .get(project_id)
            .and_then(|subs| subs.iter().find(|s| s.conn_id == conn_id))
            .ok_or_else(|| CoreError::not_found(format!("connection {conn_id}")))?;

        *subscriber.log_filter.write().expect("log filter lock poisoned") = runs;
        Ok(())
    }

    /// Deliver an event to every matching subscriber of a project.
    ///
    /// Never blocks: a full channel drops the event for that subscriber
    /// (with a warning); a closed channel marks the subscriber for removal.
    pub fn publish(&self, project_id: Uuid, event: &Event) {
        // Snapshot under a short read lock, deliver outside it.
        let targets: Vec<(Uuid, mpsc::Sender<Event>, Arc<RwLock<LogSubscription>>)> = {
            let state = self.state.read().expect("event hub lock poisoned");
            match state.projects.get(&project_id) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.conn_id, s.tx.clone(), Arc::clone(&s.log_filter)))
                    .collect(),
                None => return,
            }
        };

        let mut closed: Vec<Uuid> = Vec::new();

        for (conn_id, tx, filter) in targets {
            if let Event::AgentLog { run_id, .. } = event {
                let matches = filter
                    .read()
                    .expect("log filter lock poisoned")
                    .matches(*run_id);
                if !matches {
                    continue;
                }
            }

            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        %conn_id,
                        %project_id,
                        event = event.kind(),
                        "subscriber channel full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(conn_id);
                }
            }
        }

        for conn_id in closed {
            self.unsubscribe(conn_id);
        }
    }

    /// Number of live subscribers for a project (all users).
    pub fn subscriber_count(&self, project_id: Uuid) -> usize {
        self.state
            .read()
            .expect("event hub lock poisoned")
            .projects
            .get(&project_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(run_id: Uuid) -> Event {
        Event::AgentLog {
            run_id,
            line: "line".into(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let hub = EventHub::new(8, 5);
        let project = Uuid::new_v4();
        let mut sub = hub
            .subscribe(project, Uuid::new_v4(), LogSubscription::All)
            .unwrap();

        hub.publish(project, &Event::Heartbeat {});
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.kind(), "heartbeat");
    }

    #[tokio::test]
    async fn events_are_scoped_to_project() {
        let hub = EventHub::new(8, 5);
        let project_a = Uuid::new_v4();
        let project_b = Uuid::new_v4();
        let mut sub = hub
            .subscribe(project_a, Uuid::new_v4(), LogSubscription::All)
            .unwrap();

        hub.publish(project_b, &Event::Heartbeat {});
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_for_that_subscriber_only() {
        let hub = EventHub::new(1, 5);
        let project = Uuid::new_v4();
        let mut slow = hub
            .subscribe(project, Uuid::new_v4(), LogSubscription::All)
            .unwrap();
        let mut fast = hub
            .subscribe(project, Uuid::new_v4(), LogSubscription::All)
            .unwrap();

        // Fill both buffers, then drain only the fast one.
        hub.publish(project, &Event::Heartbeat {});
        assert!(fast.rx.try_recv().is_ok());

        // Second publish: slow's buffer is still full, fast's is empty.
        hub.publish(project, &Event::Heartbeat {});
        assert!(fast.rx.try_recv().is_ok(), "fast subscriber keeps receiving");

        // Slow got the first event only; the second was dropped.
        assert!(slow.rx.try_recv().is_ok());
        assert!(slow.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn log_filter_limits_delivery() {
        let hub = EventHub::new(8, 5);
        let project = Uuid::new_v4();
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut sub = hub
            .subscribe(
                project,
                Uuid::new_v4(),
                LogSubscription::Runs(HashSet::from([wanted])),
            )
            .unwrap();

        hub.publish(project, &log_event(other));
        hub.publish(project, &log_event(wanted));

        let event = sub.rx.recv().await.unwrap();
        match event {
            Event::AgentLog { run_id, .. } => assert_eq!(run_id, wanted),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sub.rx.try_recv().is_err(), "filtered event must not arrive");
    }

    #[tokio::test]
    async fn log_filter_updates_at_runtime() {
        let hub = EventHub::new(8, 5);
        let project = Uuid::new_v4();
        let run = Uuid::new_v4();

        let mut sub = hub
            .subscribe(
                project,
                Uuid::new_v4(),
                LogSubscription::Runs(HashSet::new()),
            )
            .unwrap();

        hub.publish(project, &log_event(run));
        assert!(sub.rx.try_recv().is_err());

        hub.update_log_subscriptions(sub.conn_id, LogSubscription::Runs(HashSet::from([run])))
            .unwrap();
        hub.publish(project, &log_event(run));
        assert!(sub.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn non_log_events_ignore_filter() {
        let hub = EventHub::new(8, 5);
        let project = Uuid::new_v4();
        let mut sub = hub
            .subscribe(
                project,
                Uuid::new_v4(),
                LogSubscription::Runs(HashSet::new()),
            )
            .unwrap();

        hub.publish(project, &Event::Heartbeat {});
        assert!(sub.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn per_user_connection_cap() {
        let hub = EventHub::new(8, 2);
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();

        let _a = hub.subscribe(project, user, LogSubscription::All).unwrap();
        let _b = hub.subscribe(project, user, LogSubscription::All).unwrap();
        let third = hub.subscribe(project, user, LogSubscription::All);
        assert!(matches!(third, Err(CoreError::Conflict(_))));

        // A different user is unaffected.
        assert!(hub
            .subscribe(project, Uuid::new_v4(), LogSubscription::All)
            .is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel_and_frees_slot() {
        let hub = EventHub::new(8, 1);
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut sub = hub.subscribe(project, user, LogSubscription::All).unwrap();
        hub.unsubscribe(sub.conn_id);

        assert!(sub.rx.recv().await.is_none(), "channel should be closed");
        assert!(hub.subscribe(project, user, LogSubscription::All).is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let hub = EventHub::new(8, 5);
        let project = Uuid::new_v4();
        let sub = hub
            .subscribe(project, Uuid::new_v4(), LogSubscription::All)
            .unwrap();
        drop(sub.rx);

        assert_eq!(hub.subscriber_count(project), 1);
        hub.publish(project, &Event::Heartbeat {});
        assert_eq!(hub.subscriber_count(project), 0);
    }
}
