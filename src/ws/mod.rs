//! UI websocket endpoint and the UI-host handshake used when the daemon
//! needs the desktop shell to materialize a window.

mod handler;

pub use handler::{run_websocket_listener, ws_router};

use std::time::Duration;

use dashmap::DashMap;

use crate::pubsub::{Broker, StarEvent};
use crate::rpc::make_auth_token;

/// Event asking the desktop shell to open a window for a workspace.
pub const EVENT_ELECTRON_NEW_WINDOW: &str = "electron:newwindow";

/// Poll interval while waiting for a window to materialize.
const WINDOW_WAIT_TICK: Duration = Duration::from_millis(50);

/// Tracks which UI windows have materialized and holds the shared secret the
/// desktop shell presents when it connects.
pub struct UiHost {
    auth_key: String,
    windows: DashMap<String, ()>,
}

impl UiHost {
    pub fn new() -> Self {
        Self {
            auth_key: make_auth_token(),
            windows: DashMap::new(),
        }
    }

    /// The key the UI must present in its websocket query string. Handed to
    /// the shell through its launch environment.
    pub fn auth_key(&self) -> &str {
        &self.auth_key
    }

    pub fn mark_window_ready(&self, window_id: &str) {
        if !window_id.is_empty() {
            self.windows.insert(window_id.to_string(), ());
        }
    }

    pub fn window_ready(&self, window_id: &str) -> bool {
        self.windows.contains_key(window_id)
    }

    /// Ask the shell to open a window for the given id.
    pub fn request_new_window(&self, broker: &Broker, window_id: &str) {
        broker.publish(StarEvent {
            event: EVENT_ELECTRON_NEW_WINDOW.to_string(),
            data: Some(serde_json::json!(window_id)),
            ..Default::default()
        });
    }

    /// Wait (bounded) for the shell to confirm a window exists.
    pub async fn wait_for_window(&self, window_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.window_ready(window_id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WINDOW_WAIT_TICK).await;
        }
    }
}

impl Default for UiHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_window() {
        let host = UiHost::new();
        assert!(!host.wait_for_window("w1", Duration::from_millis(80)).await);
        host.mark_window_ready("w1");
        assert!(host.wait_for_window("w1", Duration::from_millis(80)).await);
    }
}
