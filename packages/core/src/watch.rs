//! Change notification.
//!
//! Each session owns a `WatchHub`. Publishing never blocks the writer:
//! events go into a bounded per-subscriber channel with `try_send`, and a
//! subscriber whose channel is full or closed is dropped. Events for one
//! variable are published under the session lock in commit order, so every
//! subscriber sees them in that order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::id::{SessionId, SubscriptionId, VariableId};
use crate::lease::LivenessToken;
use crate::variable::Metadata;
use crate::Value;

/// Why a variable changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeCause {
    Set,
    Batch,
    Rollback { target_version: u64 },
}

/// A committed change to a watched variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub variable_id: VariableId,
    pub name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub version: u64,
    pub metadata: Metadata,
    /// Id of the caller that made the change.
    pub source: String,
    pub cause: ChangeCause,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// Current value, delivered first when requested at subscribe time.
    Initial {
        variable_id: VariableId,
        name: String,
        value: Value,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    Updated(UpdateEvent),
    /// Something the watched variable depends on changed.
    DependencyChanged {
        variable_id: VariableId,
        name: String,
        dependency_id: VariableId,
        dependency_name: String,
        dependency_version: u64,
        timestamp: DateTime<Utc>,
    },
    /// The watched variable was deleted. No further events follow for it.
    Deleted {
        variable_id: VariableId,
        name: String,
        timestamp: DateTime<Utc>,
    },
}

impl WatchEvent {
    pub fn variable_id(&self) -> &VariableId {
        match self {
            WatchEvent::Initial { variable_id, .. }
            | WatchEvent::DependencyChanged { variable_id, .. }
            | WatchEvent::Deleted { variable_id, .. } => variable_id,
            WatchEvent::Updated(update) => &update.variable_id,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    variables: BTreeSet<VariableId>,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Debug)]
pub(crate) struct WatchHub {
    next_id: u64,
    buffer: usize,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    by_variable: BTreeMap<VariableId, BTreeSet<SubscriptionId>>,
}

impl WatchHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            next_id: 1,
            buffer: buffer.max(1),
            subscribers: BTreeMap::new(),
            by_variable: BTreeMap::new(),
        }
    }

    /// Register a subscriber. `initial` events are queued ahead of anything
    /// published later.
    pub fn subscribe(
        &mut self,
        variables: BTreeSet<VariableId>,
        initial: Vec<WatchEvent>,
    ) -> (SubscriptionId, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer + initial.len());
        for event in initial {
            if tx.try_send(event).is_err() {
                break;
            }
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        for variable in &variables {
            self.by_variable
                .entry(variable.clone())
                .or_default()
                .insert(id);
        }
        self.subscribers.insert(id, Subscriber { variables, tx });
        (id, rx)
    }

    /// Deliver `event` to every subscriber of `variable`. Returns how many
    /// received it.
    pub fn publish(&mut self, variable: &VariableId, event: &WatchEvent) -> usize {
        let Some(ids) = self.by_variable.get(variable) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for id in ids {
            let Some(subscriber) = self.subscribers.get(id) else {
                continue;
            };
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = %id, variable = %variable, "dropping lagging subscriber");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "subscriber disconnected");
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            self.unsubscribe(id);
        }
        delivered
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return false;
        };
        for variable in &subscriber.variables {
            if let Some(ids) = self.by_variable.get_mut(variable) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_variable.remove(variable);
                }
            }
        }
        true
    }

    /// Send `event` (a deletion notice) and detach `variable`. Subscribers
    /// left watching nothing are closed.
    pub fn remove_variable(&mut self, variable: &VariableId, event: &WatchEvent) {
        self.publish(variable, event);
        let Some(ids) = self.by_variable.remove(variable) else {
            return;
        };
        for id in ids {
            let empty = match self.subscribers.get_mut(&id) {
                Some(subscriber) => {
                    subscriber.variables.remove(variable);
                    subscriber.variables.is_empty()
                }
                None => false,
            };
            if empty {
                self.subscribers.remove(&id);
            }
        }
    }

    /// Drop subscribers whose receiver is gone. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let closed: Vec<SubscriptionId> = self
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.unsubscribe(*id);
        }
        closed.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// The consumer end of a subscription.
///
/// The stream ends (yields `None`) when the subscription is cancelled, the
/// subscriber falls behind, every watched variable is deleted, or the
/// session goes away. Each stream carries its own [`LivenessToken`]; locks
/// started with it are released once the stream is dropped.
#[derive(Debug)]
pub struct WatchStream {
    id: SubscriptionId,
    session: SessionId,
    rx: mpsc::Receiver<WatchEvent>,
    liveness: LivenessToken,
}

impl WatchStream {
    pub(crate) fn new(id: SubscriptionId, session: SessionId, rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            id,
            session,
            rx,
            liveness: LivenessToken::new(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn liveness(&self) -> &LivenessToken {
        &self.liveness
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<WatchEvent, TryRecvError> {
        self.rx.try_recv()
    }

    /// Stop accepting events. Already queued events can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(id: &VariableId) -> WatchEvent {
        WatchEvent::Deleted {
            variable_id: id.clone(),
            name: "x".into(),
            timestamp: Utc::now(),
        }
    }

    fn update(id: &VariableId, version: u64) -> WatchEvent {
        WatchEvent::Updated(UpdateEvent {
            variable_id: id.clone(),
            name: "x".into(),
            old_value: Value::from(version as i64 - 1),
            new_value: Value::from(version as i64),
            version,
            metadata: Metadata::new(),
            source: "test".into(),
            cause: ChangeCause::Set,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn initial_events_come_first() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(4);
        let initial = WatchEvent::Initial {
            variable_id: id.clone(),
            name: "x".into(),
            value: Value::from(0),
            version: 0,
            timestamp: Utc::now(),
        };
        let (_, mut rx) = hub.subscribe(BTreeSet::from([id.clone()]), vec![initial.clone()]);
        hub.publish(&id, &update(&id, 1));

        assert_eq!(rx.try_recv().unwrap(), initial);
        assert!(matches!(rx.try_recv().unwrap(), WatchEvent::Updated(u) if u.version == 1));
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(16);
        let (_, mut rx) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        for version in 1..=5 {
            assert_eq!(hub.publish(&id, &update(&id, version)), 1);
        }
        for version in 1..=5 {
            match rx.try_recv().unwrap() {
                WatchEvent::Updated(u) => assert_eq!(u.version, version),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn lagging_subscriber_is_dropped() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(2);
        let (_, mut rx) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        hub.publish(&id, &update(&id, 1));
        hub.publish(&id, &update(&id, 2));
        assert_eq!(hub.publish(&id, &update(&id, 3)), 0);
        assert_eq!(hub.len(), 0);

        // Queued events are still readable, then the stream ends.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn closed_receiver_is_unsubscribed() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(4);
        let (_, rx) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        drop(rx);
        assert_eq!(hub.publish(&id, &update(&id, 1)), 0);
        assert_eq!(hub.len(), 0);
        assert!(hub.by_variable.is_empty());
    }

    #[test]
    fn prune_removes_dead_receivers() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(4);
        let (_, rx) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        let (_, _alive) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        drop(rx);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.by_variable[&id].len(), 1);
    }

    #[test]
    fn removing_the_last_watched_variable_ends_the_stream() {
        let a = VariableId::generate();
        let b = VariableId::generate();
        let mut hub = WatchHub::new(4);
        let (_, mut only_a) = hub.subscribe(BTreeSet::from([a.clone()]), Vec::new());
        let (_, mut both) = hub.subscribe(BTreeSet::from([a.clone(), b.clone()]), Vec::new());

        hub.remove_variable(&a, &deleted(&a));
        assert!(matches!(only_a.try_recv().unwrap(), WatchEvent::Deleted { .. }));
        assert_eq!(only_a.try_recv().unwrap_err(), TryRecvError::Disconnected);

        assert!(matches!(both.try_recv().unwrap(), WatchEvent::Deleted { .. }));
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.publish(&b, &update(&b, 1)), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let id = VariableId::generate();
        let mut hub = WatchHub::new(4);
        let (sub, _rx) = hub.subscribe(BTreeSet::from([id.clone()]), Vec::new());
        assert!(hub.unsubscribe(sub));
        assert!(!hub.unsubscribe(sub));
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let id = VariableId::generate();
        let json = serde_json::to_value(update(&id, 1)).unwrap();
        assert_eq!(json["type"], "updated");
        assert_eq!(json["cause"]["kind"], "set");
        assert_eq!(json["new_value"], 1);
    }
}
