//! Remote connection controllers.
//!
//! SSH and WSL connections share one state machine and differ only in
//! transport. Every state edge fires a `connchange` event so the UI can
//! track connection health; non-fatal agent bootstrap problems degrade the
//! connection to `connected-nowsh` with a stored `wsherror` instead of
//! failing it.

mod bootstrap;
mod ssh;
mod wsl;

pub use bootstrap::{compare_versions, wsh_version_up_to_date};
pub use ssh::SshConn;
pub use wsl::{WslConn, default_distro, filter_distro_names, list_distros};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::base::Paths;
use crate::obj::MetaMap;
use crate::pubsub::{Broker, EVENT_CONN_CHANGE, StarEvent};
use crate::rpc::RpcRouter;

/// Dial timeout for connect/ensure.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub const WSL_PREFIX: &str = "wsl://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    ConnectedNowsh,
    WshInstalling,
    WshUpgrading,
    Disconnected,
}

impl ConnState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnState::Connected
                | ConnState::ConnectedNowsh
                | ConnState::WshInstalling
                | ConnState::WshUpgrading
        )
    }
}

/// Snapshot of one connection for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnStatus {
    pub status: ConnState,
    pub connection: String,
    pub connected: bool,
    #[serde(rename = "hasconnected")]
    pub has_connected: bool,
    #[serde(rename = "activeconnnum")]
    pub active_conn_num: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(rename = "wshenabled")]
    pub wsh_enabled: bool,
    #[serde(rename = "wsherror", default, skip_serializing_if = "String::is_empty")]
    pub wsh_error: String,
    #[serde(rename = "wshversion", default, skip_serializing_if = "String::is_empty")]
    pub wsh_version: String,
}

/// The version an agent announces when it connects or re-checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteInfo {
    #[serde(rename = "clientversion", default)]
    pub client_version: String,
    #[serde(rename = "clientos", default, skip_serializing_if = "String::is_empty")]
    pub client_os: String,
    #[serde(rename = "clientarch", default, skip_serializing_if = "String::is_empty")]
    pub client_arch: String,
}

/// Registry of all known connections, SSH and WSL.
pub struct ConnManager {
    pub(crate) router: Arc<RpcRouter>,
    pub(crate) broker: Arc<Broker>,
    pub(crate) paths: Paths,
    ssh: DashMap<String, Arc<SshConn>>,
    wsl: DashMap<String, Arc<WslConn>>,
}

impl ConnManager {
    pub fn new(router: Arc<RpcRouter>, broker: Arc<Broker>, paths: Paths) -> Arc<Self> {
        Arc::new(Self {
            router,
            broker,
            paths,
            ssh: DashMap::new(),
            wsl: DashMap::new(),
        })
    }

    fn ssh_conn(self: &Arc<Self>, name: &str) -> Arc<SshConn> {
        self.ssh
            .entry(name.to_string())
            .or_insert_with(|| SshConn::new(name, self.clone()))
            .clone()
    }

    fn wsl_conn(self: &Arc<Self>, distro: &str) -> Arc<WslConn> {
        self.wsl
            .entry(distro.to_string())
            .or_insert_with(|| WslConn::new(distro, self.clone()))
            .clone()
    }

    /// Idempotent connect: a no-op when the connection is already up.
    pub async fn ensure(self: &Arc<Self>, name: &str, keywords: Option<MetaMap>) -> Result<()> {
        if let Some(distro) = name.strip_prefix(WSL_PREFIX) {
            return self.wsl_conn(distro).ensure().await;
        }
        self.ssh_conn(name).ensure(keywords).await
    }

    /// Always re-dials.
    pub async fn connect(self: &Arc<Self>, name: &str, keywords: Option<MetaMap>) -> Result<()> {
        if let Some(distro) = name.strip_prefix(WSL_PREFIX) {
            return self.wsl_conn(distro).connect().await;
        }
        self.ssh_conn(name).connect(keywords).await
    }

    pub async fn disconnect(self: &Arc<Self>, name: &str) -> Result<()> {
        if let Some(distro) = name.strip_prefix(WSL_PREFIX) {
            let Some(conn) = self.wsl.get(distro).map(|c| c.clone()) else {
                bail!("distro not found: {name}");
            };
            return conn.disconnect().await;
        }
        let Some(conn) = self.ssh.get(name).map(|c| c.clone()) else {
            bail!("connection not found: {name}");
        };
        conn.disconnect().await
    }

    pub async fn reinstall_wsh(self: &Arc<Self>, name: &str) -> Result<()> {
        if let Some(distro) = name.strip_prefix(WSL_PREFIX) {
            return self.wsl_conn(distro).reinstall_wsh().await;
        }
        self.ssh_conn(name).reinstall_wsh().await
    }

    /// Version reconciliation handshake: the agent on `conn_name` reports
    /// its version; returns whether it must restart into a new binary.
    pub async fn update_wsh(
        self: &Arc<Self>,
        conn_name: &str,
        remote_info: &RemoteInfo,
    ) -> Result<bool> {
        if wsh_version_up_to_date(&remote_info.client_version, crate::base::STAR_VERSION) {
            return Ok(false);
        }
        if conn_name.starts_with(WSL_PREFIX) {
            bail!("wsh update is not supported for wsl connections");
        }
        self.ssh_conn(conn_name)
            .update_wsh(remote_info)
            .await
            .with_context(|| format!("wsh update failed for connection {conn_name}"))?;
        Ok(true)
    }

    pub fn dismiss_wsh_error(self: &Arc<Self>, name: &str) -> Result<()> {
        if let Some(distro) = name.strip_prefix(WSL_PREFIX) {
            let Some(conn) = self.wsl.get(distro).map(|c| c.clone()) else {
                bail!("connection not found: {name}");
            };
            conn.clear_wsh_error();
            return Ok(());
        }
        let Some(conn) = self.ssh.get(name).map(|c| c.clone()) else {
            bail!("connection {name} not found");
        };
        conn.clear_wsh_error();
        Ok(())
    }

    pub async fn ssh_statuses(&self) -> Vec<ConnStatus> {
        let mut rtn = Vec::new();
        for conn in self.ssh.iter() {
            rtn.push(conn.value().status().await);
        }
        rtn.sort_by(|a, b| a.connection.cmp(&b.connection));
        rtn
    }

    pub async fn wsl_statuses(&self) -> Vec<ConnStatus> {
        let mut rtn = Vec::new();
        for conn in self.wsl.iter() {
            rtn.push(conn.value().status().await);
        }
        rtn.sort_by(|a, b| a.connection.cmp(&b.connection));
        rtn
    }

    pub async fn all_statuses(&self) -> Vec<ConnStatus> {
        let mut rtn = self.ssh_statuses().await;
        rtn.extend(self.wsl_statuses().await);
        rtn
    }

    /// Known connection names: configured plus currently tracked.
    pub fn connection_list(&self, configured: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut rtn: Vec<String> = configured.into_iter().collect();
        for conn in self.ssh.iter() {
            rtn.push(conn.key().clone());
        }
        for conn in self.wsl.iter() {
            rtn.push(format!("{WSL_PREFIX}{}", conn.key()));
        }
        rtn.sort();
        rtn.dedup();
        rtn
    }

    pub(crate) fn fire_conn_change(&self, name: &str, status: &ConnStatus) {
        self.broker.publish(StarEvent {
            event: EVENT_CONN_CHANGE.to_string(),
            scopes: vec![format!("connection:{name}")],
            data: serde_json::to_value(status).ok(),
            ..Default::default()
        });
    }
}
