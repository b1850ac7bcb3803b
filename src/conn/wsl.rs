//! WSL connection controller. Same state machine as SSH; the transport is
//! `wsl.exe -d <distro>` instead of an ssh session.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::process::Child;
use tokio::sync::Mutex;

use super::bootstrap::{RemoteShell, remote_home, remote_wsh_path, transfer_wsh_binary};
use super::{CONNECT_TIMEOUT, ConnManager, ConnState, ConnStatus, WSL_PREFIX};
use crate::base::{STAR_VERSION, wsh_binary_name};
use crate::rpc::attach_stdio_peer;

/// Utility distros reported by the host that are not real user distros.
const INVALID_DISTRO_NAMES: &[&str] = &["docker-desktop", "docker-desktop-data"];

struct WslInner {
    state: ConnState,
    has_connected: bool,
    active_conn_num: u64,
    last_error: String,
    wsh_error: String,
    wsh_version: String,
    child: Option<Child>,
}

pub struct WslConn {
    distro: String,
    manager: Arc<ConnManager>,
    inner: Mutex<WslInner>,
}

impl WslConn {
    pub fn new(distro: &str, manager: Arc<ConnManager>) -> Arc<Self> {
        Arc::new(Self {
            distro: distro.to_string(),
            manager,
            inner: Mutex::new(WslInner {
                state: ConnState::Init,
                has_connected: false,
                active_conn_num: 0,
                last_error: String::new(),
                wsh_error: String::new(),
                wsh_version: String::new(),
                child: None,
            }),
        })
    }

    pub fn conn_name(&self) -> String {
        format!("{WSL_PREFIX}{}", self.distro)
    }

    pub fn route_id(&self) -> String {
        format!("conn:{}", self.conn_name())
    }

    fn remote_shell(&self) -> RemoteShell {
        RemoteShell::new(
            "wsl.exe",
            vec![
                "-d".to_string(),
                self.distro.clone(),
                "--".to_string(),
                "sh".to_string(),
                "-c".to_string(),
            ],
        )
    }

    pub async fn status(&self) -> ConnStatus {
        let inner = self.inner.lock().await;
        ConnStatus {
            status: inner.state,
            connection: self.conn_name(),
            connected: inner.state.is_connected(),
            has_connected: inner.has_connected,
            active_conn_num: inner.active_conn_num,
            error: inner.last_error.clone(),
            wsh_enabled: true,
            wsh_error: inner.wsh_error.clone(),
            wsh_version: inner.wsh_version.clone(),
        }
    }

    async fn set_state(&self, state: ConnState) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = state;
            if state.is_connected() {
                inner.has_connected = true;
            }
        }
        let status = self.status().await;
        self.manager.fire_conn_change(&self.conn_name(), &status);
    }

    pub async fn ensure(self: &Arc<Self>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.state.is_connected() {
                return Ok(());
            }
        }
        self.connect().await
    }

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.last_error.clear();
            inner.active_conn_num += 1;
        }
        self.set_state(ConnState::Connecting).await;
        match tokio::time::timeout(CONNECT_TIMEOUT, self.dial()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.last_error = format!("{e:#}");
                }
                self.set_state(ConnState::Disconnected).await;
                Err(e)
            }
            Err(_) => {
                let e = anyhow::anyhow!("connection to {} timed out", self.conn_name());
                {
                    let mut inner = self.inner.lock().await;
                    inner.last_error = e.to_string();
                }
                self.set_state(ConnState::Disconnected).await;
                Err(e)
            }
        }
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        let shell = self.remote_shell();
        shell.run("true").await.context("wsl distro unreachable")?;
        match self.bootstrap_wsh(&shell).await {
            Ok(()) => {
                self.set_state(ConnState::Connected).await;
                Ok(())
            }
            Err(e) => {
                warn!("wsh bootstrap failed for {}: {e:#}", self.conn_name());
                {
                    let mut inner = self.inner.lock().await;
                    inner.wsh_error = format!("{e:#}");
                }
                self.set_state(ConnState::ConnectedNowsh).await;
                Ok(())
            }
        }
    }

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
        info!("wsh agent attached for {}", self.conn_name());
        Ok(())
    }

    async fn install_wsh_binary(&self, shell: &RemoteShell, home: &str) -> Result<()> {
        // WSL distros always run linux on the host architecture
        let arch = if cfg!(target_arch = "aarch64") {
            "arm64"
        } else {
            "x64"
        };
        let binary_name = wsh_binary_name(STAR_VERSION, "linux", arch);
        let local_path = self.manager.paths.app_bin_dir().join(&binary_name);
        let binary = tokio::fs::read(&local_path)
            .await
            .with_context(|| format!("missing bundled agent binary {}", local_path.display()))?;
        transfer_wsh_binary(shell, home, &binary).await?;
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

    pub async fn reinstall_wsh(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnState::WshUpgrading).await;
        let shell = self.remote_shell();
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

    pub fn clear_wsh_error(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut inner = this.inner.lock().await;
                inner.wsh_error.clear();
            }
            let status = this.status().await;
            this.manager.fire_conn_change(&this.conn_name(), &status);
        });
    }
}

/// Filter distro names reported by the host down to real user distros.
pub fn filter_distro_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    names
        .into_iter()
        .map(|n| n.trim_matches('\u{0}').trim().to_string())
        .filter(|n| !n.is_empty() && !INVALID_DISTRO_NAMES.contains(&n.as_str()))
        .collect()
}

/// List registered WSL distros via `wsl.exe -l -q`.
pub async fn list_distros() -> Result<Vec<String>> {
    let output = tokio::process::Command::new("wsl.exe")
        .args(["-l", "-q"])
        .output()
        .await
        .context("running wsl.exe -l -q")?;
    // wsl.exe emits UTF-16LE; strip the interleaved NULs
    let text: String = String::from_utf8_lossy(&output.stdout)
        .chars()
        .filter(|c| *c != '\u{0}')
        .collect();
    Ok(filter_distro_names(text.lines().map(|l| l.to_string())))
}

/// The default distro is the first one the host reports.
pub async fn default_distro() -> Result<String> {
    let distros = list_distros().await?;
    distros
        .into_iter()
        .next()
        .context("unable to determine default distro")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_distro_names() {
        let names = vec![
            "Ubuntu".to_string(),
            "docker-desktop".to_string(),
            "docker-desktop-data".to_string(),
            "".to_string(),
            "Debian".to_string(),
        ];
        assert_eq!(filter_distro_names(names), vec!["Ubuntu", "Debian"]);
    }
}
