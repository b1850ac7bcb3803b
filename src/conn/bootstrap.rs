//! Remote-execution plumbing shared by the SSH and WSL controllers: running
//! one-shot commands on the remote, detecting its platform, transferring the
//! wsh agent binary, and comparing agent versions.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::base::{REMOTE_STAR_HOME_DIR, REMOTE_WSH_BIN_DIR, validate_wsh_platform};

/// How a controller reaches its remote: a program plus the fixed argument
/// prefix that precedes every remote command line.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl RemoteShell {
    pub fn new(program: impl Into<String>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    /// Run a remote command and capture stdout. Fails on non-zero exit.
    pub async fn run(&self, remote_cmd: &str) -> Result<String> {
        debug!("remote exec: {} {:?} {remote_cmd}", self.program, self.prefix_args);
        let output = Command::new(&self.program)
            .args(&self.prefix_args)
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {} on remote", remote_cmd))?;
        if !output.status.success() {
            bail!(
                "remote command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a remote command, streaming `input` to its stdin.
    pub async fn run_with_input(&self, remote_cmd: &str, input: &[u8]) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .arg(remote_cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning remote command {remote_cmd:?}"))?;
        let mut stdin = child.stdin.take().context("no stdin pipe")?;
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "remote command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Spawn a long-running remote command with piped stdio for use as an
    /// RPC transport.
    pub fn spawn_stdio(&self, remote_cmd: &str) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.prefix_args)
            .arg(remote_cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {remote_cmd:?}"))
    }
}

/// Parse `uname -sm` output into a validated (os, arch) pair.
pub fn parse_uname(output: &str) -> Result<(String, String)> {
    let mut parts = output.split_whitespace();
    let (Some(os), Some(arch)) = (parts.next(), parts.next()) else {
        bail!("unexpected uname output: {output:?}");
    };
    let os = match os {
        "Linux" => "linux",
        "Darwin" => "darwin",
        other if other.starts_with("MINGW") || other.starts_with("Windows") => "windows",
        other => other,
    };
    validate_wsh_platform(os, &arch.to_lowercase())
}

/// Detect the remote platform tuple.
pub async fn detect_remote_platform(shell: &RemoteShell) -> Result<(String, String)> {
    let out = shell.run("uname -sm").await.context("detecting remote platform")?;
    parse_uname(&out)
}

/// Resolve the remote home directory. The agent install path is always
/// built from this absolute path; an unexpanded `~` never reaches exec.
pub async fn remote_home(shell: &RemoteShell) -> Result<String> {
    let home = shell.run("sh -c 'echo $HOME'").await.context("resolving remote home")?;
    if home.is_empty() {
        bail!("remote $HOME is empty");
    }
    Ok(home)
}

/// Absolute path of the installed agent binary on the remote.
pub fn remote_wsh_path(home: &str) -> String {
    format!("{home}/{REMOTE_STAR_HOME_DIR}/{REMOTE_WSH_BIN_DIR}/wsh")
}

/// Copy the agent binary to the remote atomically: write to a temp name in
/// the target directory, chmod, rename into place.
pub async fn transfer_wsh_binary(shell: &RemoteShell, home: &str, binary: &[u8]) -> Result<()> {
    let bin_dir = format!("{home}/{REMOTE_STAR_HOME_DIR}/{REMOTE_WSH_BIN_DIR}");
    let final_path = remote_wsh_path(home);
    let tmp_path = format!("{final_path}.tmp");
    shell
        .run(&format!("mkdir -p {bin_dir}"))
        .await
        .context("creating remote bin dir")?;
    shell
        .run_with_input(&format!("cat > {tmp_path}"), binary)
        .await
        .context("uploading wsh binary")?;
    shell
        .run(&format!("chmod 755 {tmp_path} && mv {tmp_path} {final_path}"))
        .await
        .context("installing wsh binary")?;
    Ok(())
}

/// Compare dotted versions, ignoring a leading `v`. Missing components
/// count as zero.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }
    let (pa, pb) = (parts(a), parts(b));
    for i in 0..pa.len().max(pb.len()) {
        let va = pa.get(i).copied().unwrap_or(0);
        let vb = pb.get(i).copied().unwrap_or(0);
        match va.cmp(&vb) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Whether an agent reporting `client_version` is current relative to the
/// bundled version.
pub fn wsh_version_up_to_date(client_version: &str, local_version: &str) -> bool {
    compare_versions(client_version, local_version) != std::cmp::Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_parse_uname() {
        assert_eq!(
            parse_uname("Linux x86_64").unwrap(),
            ("linux".to_string(), "x64".to_string())
        );
        assert_eq!(
            parse_uname("Darwin arm64").unwrap(),
            ("darwin".to_string(), "arm64".to_string())
        );
        assert_eq!(
            parse_uname("Linux aarch64").unwrap(),
            ("linux".to_string(), "arm64".to_string())
        );
        assert!(parse_uname("Linux mips").is_err());
        assert!(parse_uname("garbage").is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("0.1.0", "0.1.0"), Ordering::Equal);
        assert_eq!(compare_versions("v0.1.0", "0.1.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.0.9", "0.1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "0.9.9"), Ordering::Greater);
        assert!(wsh_version_up_to_date("0.2.0", "0.1.5"));
        assert!(!wsh_version_up_to_date("0.1.0", "0.1.5"));
    }

    #[test]
    fn test_remote_wsh_path_is_absolute() {
        let path = remote_wsh_path("/home/user");
        assert_eq!(path, "/home/user/.starterm/bin/wsh");
        assert!(!path.contains('~'));
    }
}
