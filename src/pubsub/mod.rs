//! Pub/sub event broker.
//!
//! Delivers [`StarEvent`] records to subscribers filtered by event name and
//! scope, keeps a bounded per-event history ring for late subscribers, and
//! converts object-store update records into `starobj:update` events.
//! Delivery is best-effort per subscriber: a slow consumer gets dropped
//! messages (logged), never blocks the publisher or other subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::obj::UpdateRecord;

pub const EVENT_STAROBJ_UPDATE: &str = "starobj:update";
pub const EVENT_CONN_CHANGE: &str = "connchange";
pub const EVENT_BLOCK_CLOSE: &str = "blockclose";
pub const EVENT_BLOCK_FILE: &str = "blockfile";
pub const EVENT_WORKSPACE_UPDATE: &str = "workspace:update";
pub const EVENT_ROUTE_UP: &str = "route:up";
pub const EVENT_ROUTE_GONE: &str = "route:gone";
pub const EVENT_CONFIG_UPDATE: &str = "config";

/// Per-subscriber queue depth; past this the broker drops events for that
/// subscriber instead of blocking.
const SUBSCRIBER_QUEUE_SIZE: usize = 32;

/// Bound on each event-name history ring.
const EVENT_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(rename = "allscopes", default)]
    pub all_scopes: bool,
}

impl SubscriptionRequest {
    fn matches(&self, event: &StarEvent) -> bool {
        if self.event != event.event {
            return false;
        }
        if self.all_scopes || self.scopes.iter().any(|s| s == "*") {
            return true;
        }
        if self.scopes.is_empty() {
            // un-scoped subscription matches un-scoped events only
            return event.scopes.is_empty();
        }
        event
            .scopes
            .iter()
            .any(|es| self.scopes.iter().any(|ss| ss == es))
    }
}

#[derive(Default)]
pub struct Broker {
    /// event name -> subscriber id -> subscription
    subs: Mutex<HashMap<String, HashMap<String, SubscriptionRequest>>>,
    /// subscriber id -> delivery queue
    clients: DashMap<String, mpsc::Sender<StarEvent>>,
    /// event name -> most-recent events
    history: Mutex<HashMap<String, VecDeque<StarEvent>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery channel for a subscriber (usually a route id).
    /// Returns the receiving side the caller must drain.
    pub fn register_client(&self, subscriber_id: &str) -> mpsc::Receiver<StarEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        self.clients.insert(subscriber_id.to_string(), tx);
        rx
    }

    /// Drop a subscriber's channel and all of its subscriptions.
    pub fn unregister_client(&self, subscriber_id: &str) {
        self.clients.remove(subscriber_id);
        self.unsubscribe_all(subscriber_id);
    }

    /// Add or replace the subscriber's subscription for an event name.
    pub fn subscribe(&self, subscriber_id: &str, sub: SubscriptionRequest) {
        if sub.event.is_empty() {
            return;
        }
        let mut subs = self.subs.lock().unwrap();
        subs.entry(sub.event.clone())
            .or_default()
            .insert(subscriber_id.to_string(), sub);
    }

    pub fn unsubscribe(&self, subscriber_id: &str, event: &str) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(by_sub) = subs.get_mut(event) {
            by_sub.remove(subscriber_id);
            if by_sub.is_empty() {
                subs.remove(event);
            }
        }
    }

    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|_, by_sub| {
            by_sub.remove(subscriber_id);
            !by_sub.is_empty()
        });
    }

    /// Fan an event out to matching subscribers. Returns the number of
    /// subscribers the event was queued for.
    pub fn publish(&self, event: StarEvent) -> usize {
        self.record_history(&event);
        let targets: Vec<String> = {
            let subs = self.subs.lock().unwrap();
            match subs.get(&event.event) {
                None => Vec::new(),
                Some(by_sub) => by_sub
                    .iter()
                    .filter(|(_, sub)| sub.matches(&event))
                    .map(|(id, _)| id.clone())
                    .collect(),
            }
        };
        let mut delivered = 0;
        for subscriber_id in targets {
            // never deliver an event back to its sender
            if !event.sender.is_empty() && subscriber_id == event.sender {
                continue;
            }
            let Some(client) = self.clients.get(&subscriber_id) else {
                debug!("no client channel for subscriber {subscriber_id}");
                continue;
            };
            match client.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "dropping event {} for slow subscriber {subscriber_id}",
                        event.event
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("subscriber {subscriber_id} channel closed");
                }
            }
        }
        delivered
    }

    fn record_history(&self, event: &StarEvent) {
        let mut history = self.history.lock().unwrap();
        let ring = history.entry(event.event.clone()).or_default();
        if ring.len() >= EVENT_HISTORY_SIZE {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }

    /// Most-recent matching events, oldest first, capped at `max_items`.
    pub fn read_event_history(
        &self,
        event: &str,
        scope: &str,
        max_items: usize,
    ) -> Vec<StarEvent> {
        let history = self.history.lock().unwrap();
        let Some(ring) = history.get(event) else {
            return Vec::new();
        };
        let mut rtn: Vec<StarEvent> = ring
            .iter()
            .rev()
            .filter(|ev| scope.is_empty() || scope == "*" || ev.scopes.iter().any(|s| s == scope))
            .take(max_items)
            .cloned()
            .collect();
        rtn.reverse();
        rtn
    }

    /// Convert store update records into `starobj:update` events, one per
    /// record, each scoped to the record's ORef, in commit order.
    pub fn send_update_events(&self, updates: &[UpdateRecord]) {
        for record in updates {
            let data = serde_json::to_value(record).expect("update records always serialize");
            self.publish(StarEvent {
                event: EVENT_STAROBJ_UPDATE.to_string(),
                sender: String::new(),
                scopes: vec![record.oref().to_string()],
                data: Some(data),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, scopes: &[&str]) -> StarEvent {
        StarEvent {
            event: name.to_string(),
            sender: String::new(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            data: Some(json!({"k": "v"})),
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers_once() {
        let broker = Broker::new();
        let mut rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "blockclose".into(),
                scopes: vec!["block:abc".into()],
                all_scopes: false,
            },
        );
        let n = broker.publish(event("blockclose", &["block:abc"]));
        assert_eq!(n, 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event, "blockclose");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_before_subscribe_never_delivers() {
        let broker = Broker::new();
        let mut rx = broker.register_client("sub1");
        broker.publish(event("blockclose", &["block:abc"]));
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "blockclose".into(),
                scopes: vec!["block:abc".into()],
                all_scopes: false,
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let broker = Broker::new();
        let mut rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "starobj:update".into(),
                scopes: vec!["tab:t1".into()],
                all_scopes: false,
            },
        );
        assert_eq!(broker.publish(event("starobj:update", &["tab:t2"])), 0);
        assert_eq!(broker.publish(event("starobj:update", &["tab:t1"])), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.scopes, vec!["tab:t1"]);
    }

    #[tokio::test]
    async fn test_wildcard_scope_matches_everything() {
        let broker = Broker::new();
        let _rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "connchange".into(),
                scopes: vec!["*".into()],
                all_scopes: false,
            },
        );
        assert_eq!(broker.publish(event("connchange", &["conn:x"])), 1);
        assert_eq!(broker.publish(event("connchange", &[])), 1);
    }

    #[tokio::test]
    async fn test_sender_does_not_receive_own_event() {
        let broker = Broker::new();
        let _rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "connchange".into(),
                all_scopes: true,
                ..Default::default()
            },
        );
        let mut ev = event("connchange", &[]);
        ev.sender = "sub1".into();
        assert_eq!(broker.publish(ev), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_not_blocks() {
        let broker = Broker::new();
        let _rx = broker.register_client("slow");
        broker.subscribe(
            "slow",
            SubscriptionRequest {
                event: "blockfile".into(),
                all_scopes: true,
                ..Default::default()
            },
        );
        // queue depth is 32; publishing more must not block
        for _ in 0..(SUBSCRIBER_QUEUE_SIZE + 10) {
            broker.publish(event("blockfile", &["block:z"]));
        }
    }

    #[tokio::test]
    async fn test_history_ring() {
        let broker = Broker::new();
        for i in 0..5 {
            let mut ev = event("blockclose", &["block:h"]);
            ev.data = Some(json!(i));
            broker.publish(ev);
        }
        let recent = broker.read_event_history("blockclose", "block:h", 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].data, Some(json!(2)));
        assert_eq!(recent[2].data, Some(json!(4)));
        assert!(broker.read_event_history("nosuch", "", 10).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_on_disconnect() {
        let broker = Broker::new();
        let _rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: "connchange".into(),
                all_scopes: true,
                ..Default::default()
            },
        );
        broker.unregister_client("sub1");
        assert_eq!(broker.publish(event("connchange", &[])), 0);
    }

    #[tokio::test]
    async fn test_send_update_events_scoped_to_oref() {
        let broker = Broker::new();
        let mut rx = broker.register_client("sub1");
        broker.subscribe(
            "sub1",
            SubscriptionRequest {
                event: EVENT_STAROBJ_UPDATE.into(),
                scopes: vec!["block:b1".into()],
                all_scopes: false,
            },
        );
        let records = vec![
            UpdateRecord::delete("block", "b1"),
            UpdateRecord::delete("tab", "t1"),
        ];
        broker.send_update_events(&records);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.scopes, vec!["block:b1"]);
        assert!(rx.try_recv().is_err());
    }
}
