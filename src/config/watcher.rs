//! Config watcher: holds the current [`FullConfig`] and re-reads it when
//! anything under the config directory changes, publishing a config event.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::{FullConfig, read_full_config};
use crate::base::Paths;
use crate::pubsub::{Broker, EVENT_CONFIG_UPDATE, StarEvent};

pub struct ConfigWatcher {
    paths: Paths,
    full: RwLock<FullConfig>,
    broker: Arc<Broker>,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    pub fn new(paths: Paths, broker: Arc<Broker>) -> Arc<Self> {
        let full = read_full_config(&paths);
        for err in &full.config_errors {
            warn!("config error in {}: {}", err.file, err.err);
        }
        Arc::new(Self {
            paths,
            full: RwLock::new(full),
            broker,
            watcher: std::sync::Mutex::new(None),
        })
    }

    /// Snapshot of the current config.
    pub fn full_config(&self) -> FullConfig {
        self.full.read().unwrap().clone()
    }

    /// Re-read from disk and broadcast the new config.
    pub fn reread(&self) {
        let full = read_full_config(&self.paths);
        for err in &full.config_errors {
            warn!("config error in {}: {}", err.file, err.err);
        }
        let data = serde_json::to_value(&full).ok();
        *self.full.write().unwrap() = full;
        self.broker.publish(StarEvent {
            event: EVENT_CONFIG_UPDATE.to_string(),
            data,
            ..Default::default()
        });
    }

    /// Start watching the config directory. Events are debounced only by
    /// the cheapness of reread; bursts collapse in practice.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let this = Arc::downgrade(self);
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let Some(this) = this.upgrade() else {
                    return;
                };
                match res {
                    Ok(event) => {
                        debug!("config change: {:?}", event.kind);
                        this.reread();
                    }
                    Err(e) => warn!("config watcher error: {e}"),
                }
            },
        )
        .context("creating config watcher")?;
        std::fs::create_dir_all(&self.paths.config_dir).ok();
        watcher
            .watch(&self.paths.config_dir, RecursiveMode::Recursive)
            .context("watching config directory")?;
        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    /// Stop watching. Called during shutdown.
    pub fn stop(&self) {
        *self.watcher.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reread_publishes_config_event() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        std::fs::create_dir_all(&paths.config_dir).unwrap();
        let broker = Arc::new(Broker::new());
        let watcher = ConfigWatcher::new(paths.clone(), broker.clone());

        let mut rx = broker.register_client("sub");
        broker.subscribe(
            "sub",
            crate::pubsub::SubscriptionRequest {
                event: EVENT_CONFIG_UPDATE.into(),
                all_scopes: true,
                ..Default::default()
            },
        );

        std::fs::write(
            paths.config_dir.join("settings.json"),
            r#"{"term:fontsize": 18}"#,
        )
        .unwrap();
        watcher.reread();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event, EVENT_CONFIG_UPDATE);
        assert_eq!(
            watcher.full_config().settings.term_font_size,
            Some(18.0)
        );
    }
}
