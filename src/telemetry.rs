//! Activity counters and telemetry events, kept in memory. Shipping is an
//! external concern; the periodic flush here only logs what would be sent.

use std::sync::Mutex;

use dashmap::DashMap;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static ACTIVITY_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z:#]+$").unwrap());

const MAX_ACTIVITY_KEY_LEN: usize = 20;

/// Interval between flush checks; the actual send cadence is governed by
/// `next_send`, so the tick stays cheap.
pub const FLUSH_TICK_SECS: u64 = 60;
const SEND_INTERVAL_SECS: i64 = 60 * 60 * 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TEventProps {
    #[serde(rename = "blockview", default, skip_serializing_if = "String::is_empty")]
    pub block_view: String,
    #[serde(rename = "wshcmd", default, skip_serializing_if = "String::is_empty")]
    pub wsh_cmd: String,
    #[serde(rename = "wshhaderror", default, skip_serializing_if = "std::ops::Not::not")]
    pub wsh_had_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TEvent {
    pub event: String,
    #[serde(default)]
    pub props: TEventProps,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityUpdate {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub renderers: HashMap<String, i64>,
    #[serde(rename = "wshcmds", default, skip_serializing_if = "HashMap::is_empty")]
    pub wsh_cmds: HashMap<String, i64>,
}

#[derive(Default)]
pub struct Telemetry {
    renderers: DashMap<String, i64>,
    wsh_cmds: DashMap<String, i64>,
    events: Mutex<Vec<TEvent>>,
    next_send: Mutex<i64>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tevent(&self, event: TEvent) {
        debug!("tevent: {}", event.event);
        self.events.lock().unwrap().push(event);
    }

    pub fn update_activity(&self, update: ActivityUpdate) {
        for (key, count) in update.renderers {
            *self.renderers.entry(key).or_default() += count;
        }
        for (key, count) in update.wsh_cmds {
            *self.wsh_cmds.entry(key).or_default() += count;
        }
    }

    /// Record a `wsh:run` activity map from the companion CLI. Keys must
    /// match `^[a-z:#]+$`, be at most 20 chars, and carry the value 1;
    /// invalid entries are dropped silently.
    pub fn record_wsh_activity(&self, mut data: HashMap<String, i64>) {
        data.retain(|key, value| {
            key.len() <= MAX_ACTIVITY_KEY_LEN && ACTIVITY_KEY_RE.is_match(key) && *value == 1
        });
        if data.is_empty() {
            return;
        }
        let mut props = TEventProps::default();
        for key in data.keys() {
            if key.ends_with("#error") {
                props.wsh_had_error = true;
            } else {
                props.wsh_cmd = key.clone();
            }
        }
        self.update_activity(ActivityUpdate {
            wsh_cmds: data,
            ..Default::default()
        });
        self.record_tevent(TEvent {
            event: "wsh:run".to_string(),
            props,
        });
    }

    /// Flush if the next-send timestamp has passed. Driven by a coarse
    /// timer tick; returns whether a send happened.
    pub fn maybe_flush(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        {
            let mut next_send = self.next_send.lock().unwrap();
            if now < *next_send {
                return false;
            }
            *next_send = now + SEND_INTERVAL_SECS;
        }
        let events: Vec<TEvent> = std::mem::take(&mut *self.events.lock().unwrap());
        let renderer_count: i64 = self.renderers.iter().map(|e| *e.value()).sum();
        let wsh_count: i64 = self.wsh_cmds.iter().map(|e| *e.value()).sum();
        info!(
            "telemetry flush: {} events, {renderer_count} renderer activations, {wsh_count} wsh commands",
            events.len()
        );
        true
    }

    #[cfg(test)]
    fn wsh_cmd_count(&self, key: &str) -> i64 {
        self.wsh_cmds.get(key).map(|e| *e.value()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wsh_activity_key_validation() {
        let t = Telemetry::new();
        t.record_wsh_activity(HashMap::from([
            ("view".to_string(), 1),
            ("conn#error".to_string(), 1),
            ("Bad-Key".to_string(), 1),
            ("averyveryverylongactivitykey".to_string(), 1),
            ("view".to_string(), 5),
        ]));
        assert_eq!(t.wsh_cmd_count("conn#error"), 1);
        assert_eq!(t.wsh_cmd_count("Bad-Key"), 0);
        assert_eq!(t.wsh_cmd_count("averyveryverylongactivitykey"), 0);

        let events = t.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "wsh:run");
        assert!(events[0].props.wsh_had_error);
    }

    #[test]
    fn test_all_invalid_records_nothing() {
        let t = Telemetry::new();
        t.record_wsh_activity(HashMap::from([("NOPE".to_string(), 1)]));
        assert!(t.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_flush_respects_next_send() {
        let t = Telemetry::new();
        assert!(t.maybe_flush());
        assert!(!t.maybe_flush());
    }
}
