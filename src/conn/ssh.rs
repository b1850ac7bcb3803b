//! SSH connection controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::process::Child;
use tokio::sync::Mutex;

use super::bootstrap::{
    RemoteShell, detect_remote_platform, remote_home, remote_wsh_path, transfer_wsh_binary,
};
use super::{CONNECT_TIMEOUT, ConnManager, ConnState, ConnStatus, RemoteInfo};
use crate::base::{STAR_VERSION, wsh_binary_name};
use crate::obj::MetaMap;
use crate::rpc::attach_stdio_peer;

struct ConnInner {
    state: ConnState,
    has_connected: bool,
    active_conn_num: u64,
    last_error: String,
    wsh_error: String,
    wsh_version: String,
    wsh_enabled: bool,
    keywords: MetaMap,
    child: Option<Child>,
}

pub struct SshConn {
    name: String,
    manager: Arc<ConnManager>,
    inner: Mutex<ConnInner>,
}

impl SshConn {
    pub fn new(name: &str, manager: Arc<ConnManager>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            manager,
            inner: Mutex::new(ConnInner {
                state: ConnState::Init,
                has_connected: false,
                active_conn_num: 0,
                last_error: String::new(),
                wsh_error: String::new(),
                wsh_version: String::new(),
                wsh_enabled: true,
                keywords: MetaMap::new(),
                child: None,
            }),
        })
    }

    pub fn route_id(&self) -> String {
        format!("conn:{}", self.name)
    }

    pub async fn status(&self) -> ConnStatus {
        let inner = self.inner.lock().await;
        ConnStatus {
            status: inner.state,
            connection: self.name.clone(),
            connected: inner.state.is_connected(),
            has_connected: inner.has_connected,
            active_conn_num: inner.active_conn_num,
            error: inner.last_error.clone(),
            wsh_enabled: inner.wsh_enabled,
            wsh_error: inner.wsh_error.clone(),
            wsh_version: inner.wsh_version.clone(),
        }
    }

    async fn set_state(&self, state: ConnState) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = state;
            if state == ConnState::Connected || state == ConnState::ConnectedNowsh {
                inner.has_connected = true;
            }
        }
        let status = self.status().await;
        self.manager.fire_conn_change(&self.name, &status);
    }

    pub async fn ensure(self: &Arc<Self>, keywords: Option<MetaMap>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.state.is_connected() {
                return Ok(());
            }
        }
        self.connect(keywords).await
    }

    pub async fn connect(self: &Arc<Self>, keywords: Option<MetaMap>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(kw) = keywords {
                inner.keywords = kw;
            }
            inner.last_error.clear();
            inner.active_conn_num += 1;
        }
        self.set_state(ConnState::Connecting).await;
        let result = tokio::time::timeout(CONNECT_TIMEOUT, self.dial()).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.record_failure(&format!("{e:#}")).await;
                Err(e)
            }
            Err(_) => {
                let e = anyhow::anyhow!("connection to {} timed out", self.name);
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, err: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.last_error = err.to_string();
            inner.child = None;
        }
        self.set_state(ConnState::Disconnected).await;
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        let shell = self.remote_shell().await;
        // a cheap true both validates ssh reachability and warms auth
        shell.run("true").await.context("ssh dial failed")?;

        let wsh_enabled = { self.inner.lock().await.wsh_enabled };
        if !wsh_enabled {
            self.set_state(ConnState::ConnectedNowsh).await;
            return Ok(());
        }
        match self.bootstrap_wsh(&shell).await {
            Ok(()) => {
                self.set_state(ConnState::Connected).await;
                Ok(())
            }
            Err(e) => {
                // degraded mode: the shell still works without the agent
                warn!("wsh bootstrap failed for {}: {e:#}", self.name);
                {
                    let mut inner = self.inner.lock().await;
                    inner.wsh_error = format!("{e:#}");
                }
                self.set_state(ConnState::ConnectedNowsh).await;
                Ok(())
            }
        }
    }

    /// Install (if needed) and start the remote agent, adopting its stdio
    /// as an RPC transport on route `conn:<name>`.
    async fn bootstrap_wsh(self: &Arc<Self>, shell: &RemoteShell) -> Result<()> {
        self.set_state(ConnState::WshInstalling).await;
        let home = remote_home(shell).await?;
        let wsh_path = remote_wsh_path(&home);

        let installed = shell
            .run(&format!("test -x {wsh_path} && echo ok || echo missing"))
            .await
            .unwrap_or_default();
        if installed != "ok" {
            self.install_wsh_binary(shell, &home).await?;
        }

        let mut child = shell.spawn_stdio(&format!("{wsh_path} connserver"))?;
        let stdout = child.stdout.take().context("no stdout pipe")?;
        let stdin = child.stdin.take().context("no stdin pipe")?;
        attach_stdio_peer(
            &self.route_id(),
            stdout,
            stdin,
            self.manager.router.clone(),
            self.manager.broker.clone(),
        );
        {
            let mut inner = self.inner.lock().await;
            inner.child = Some(child);
        }
        info!("wsh agent attached for {} (route {})", self.name, self.route_id());
        Ok(())
    }

    async fn install_wsh_binary(&self, shell: &RemoteShell, home: &str) -> Result<()> {
        let (os, arch) = detect_remote_platform(shell).await?;
        let binary_name = wsh_binary_name(STAR_VERSION, &os, &arch);
        let local_path = self.manager.paths.app_bin_dir().join(&binary_name);
        let binary = tokio::fs::read(&local_path)
            .await
            .with_context(|| format!("missing bundled agent binary {}", local_path.display()))?;
        transfer_wsh_binary(shell, home, &binary).await?;
        info!("installed {} on {}", binary_name, self.name);
        Ok(())
    }

    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(mut child) = inner.child.take() {
                let _ = child.start_kill();
            }
        }
        self.manager.router.dispose_route(&self.route_id());
        self.set_state(ConnState::Disconnected).await;
        Ok(())
    }

    /// Copy the bundled agent binary to the remote and restart it.
    pub async fn reinstall_wsh(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnState::WshUpgrading).await;
        let shell = self.remote_shell().await;
        let result = async {
            let home = remote_home(&shell).await?;
            self.install_wsh_binary(&shell, &home).await
        }
        .await;
        match result {
            Ok(()) => {
                self.set_state(ConnState::Connected).await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.wsh_error = format!("{e:#}");
                }
                self.set_state(ConnState::ConnectedNowsh).await;
                Err(e)
            }
        }
    }

    /// The agent reported an outdated version: reinstall so it can re-exec.
    pub async fn update_wsh(self: &Arc<Self>, remote_info: &RemoteInfo) -> Result<()> {
        info!(
            "updating wsh for {} (agent {}, local {})",
            self.name, remote_info.client_version, STAR_VERSION
        );
        {
            let mut inner = self.inner.lock().await;
            inner.wsh_version = remote_info.client_version.clone();
        }
        self.reinstall_wsh().await
    }

    pub fn clear_wsh_error(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut inner = this.inner.lock().await;
                inner.wsh_error.clear();
            }
            let status = this.status().await;
            this.manager.fire_conn_change(&this.name, &status);
        });
    }

    async fn remote_shell(&self) -> RemoteShell {
        let keywords = { self.inner.lock().await.keywords.clone() };
        RemoteShell::new("ssh", build_ssh_args(&self.name, &keywords))
    }
}

/// Build the ssh argument prefix from a connection name and its user
/// keywords (`ssh:port`, `ssh:user`, `ssh:identityfile`, `ssh:batchmode`).
pub fn build_ssh_args(name: &str, keywords: &MetaMap) -> Vec<String> {
    let mut args = Vec::new();
    if keywords.get_bool("ssh:batchmode", true) {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }
    let port = keywords.get_string("ssh:port", "");
    if !port.is_empty() {
        args.push("-p".to_string());
        args.push(port);
    }
    if let Some(serde_json::Value::Array(files)) = keywords.get("ssh:identityfile") {
        for file in files {
            if let Some(path) = file.as_str() {
                args.push("-i".to_string());
                args.push(path.to_string());
            }
        }
    }
    let user = keywords.get_string("ssh:user", "");
    let hostname = keywords.get_string("ssh:hostname", "");
    let target = if !hostname.is_empty() {
        if !user.is_empty() {
            format!("{user}@{hostname}")
        } else {
            hostname
        }
    } else {
        name.to_string()
    };
    args.push(target);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_ssh_args_defaults() {
        let args = build_ssh_args("user@host", &MetaMap::new());
        assert_eq!(args, vec!["-o", "BatchMode=yes", "user@host"]);
    }

    #[test]
    fn test_build_ssh_args_keywords() {
        let keywords: MetaMap = [
            ("ssh:port".to_string(), json!("2222")),
            ("ssh:user".to_string(), json!("admin")),
            ("ssh:hostname".to_string(), json!("example.com")),
            ("ssh:identityfile".to_string(), json!(["/keys/id_ed25519"])),
            ("ssh:batchmode".to_string(), json!(false)),
        ]
        .into_iter()
        .collect();
        let args = build_ssh_args("ignored", &keywords);
        assert_eq!(
            args,
            vec!["-p", "2222", "-i", "/keys/id_ed25519", "admin@example.com"]
        );
    }
}
