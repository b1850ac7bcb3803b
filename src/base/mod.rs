//! Base paths, environment contract, and process-singleton lock.
//!
//! The daemon resolves its data and config directories from environment
//! variables at startup, then unsets them so child processes never inherit
//! them. All other path helpers derive from the captured values.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use log::debug;

pub const DATA_HOME_ENV: &str = "STARTERM_DATA_HOME";
pub const CONFIG_HOME_ENV: &str = "STARTERM_CONFIG_HOME";
pub const APP_PATH_ENV: &str = "STARTERM_APP_PATH";
pub const DEV_ENV: &str = "STARTERM_DEV";

pub const JWT_ENV: &str = "STARTERM_JWT";
pub const SWAP_TOKEN_ENV: &str = "STARTERM_SWAPTOKEN";

pub const DB_DIR: &str = "db";
pub const DB_FILE: &str = "starterm.db";
pub const LOCK_FILE: &str = "star.lock";
pub const DOMAIN_SOCKET_FILE: &str = "star.sock";
pub const BIN_DIR: &str = "bin";
pub const SHELL_DIR: &str = "shell";

pub const REMOTE_STAR_HOME_DIR: &str = ".starterm";
pub const REMOTE_WSH_BIN_DIR: &str = "bin";

pub const STAR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform tuples for which a prebuilt wsh agent binary is shipped.
pub const SUPPORTED_WSH_PLATFORMS: &[&str] = &[
    "darwin-x64",
    "darwin-arm64",
    "linux-x64",
    "linux-arm64",
    "windows-x64",
    "windows-arm64",
];

/// Resolved base directories, captured once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub app_path: Option<PathBuf>,
    pub dev_mode: bool,
}

impl Paths {
    /// Capture the STARTERM_* environment variables and unset them so that
    /// shells and agents launched by the daemon never inherit them.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var(DATA_HOME_ENV)
            .with_context(|| format!("{DATA_HOME_ENV} not set"))?;
        let config_dir = std::env::var(CONFIG_HOME_ENV)
            .with_context(|| format!("{CONFIG_HOME_ENV} not set"))?;
        let app_path = std::env::var(APP_PATH_ENV).ok().map(PathBuf::from);
        let dev_mode = std::env::var(DEV_ENV).is_ok_and(|v| !v.is_empty());
        for var in [DATA_HOME_ENV, CONFIG_HOME_ENV, APP_PATH_ENV, DEV_ENV] {
            std::env::remove_var(var);
        }
        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            config_dir: PathBuf::from(config_dir),
            app_path,
            dev_mode,
        })
    }

    /// Build paths from explicit directories (used by tests).
    pub fn new(data_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
            app_path: None,
            dev_mode: false,
        }
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join(DB_DIR).join(DB_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    pub fn domain_socket(&self) -> PathBuf {
        self.data_dir.join(DOMAIN_SOCKET_FILE)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.data_dir.join(BIN_DIR)
    }

    pub fn shell_dir(&self) -> PathBuf {
        self.data_dir.join(SHELL_DIR)
    }

    /// Directory holding the prebuilt per-platform wsh binaries bundled with
    /// the app. Falls back to the local bin dir in dev mode.
    pub fn app_bin_dir(&self) -> PathBuf {
        match &self.app_path {
            Some(p) => p.join(BIN_DIR),
            None => self.bin_dir(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.data_dir.join(DB_DIR),
            self.bin_dir(),
            self.shell_dir(),
            self.config_dir.clone(),
            self.config_dir.join("presets"),
        ] {
            try_mkdirs(&dir)?;
        }
        Ok(())
    }
}

fn try_mkdirs(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Ok(info) if info.is_dir() => Ok(()),
        Ok(_) => bail!("{} exists but is not a directory", dir.display()),
        Err(_) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create directory {}", dir.display()))?;
            Ok(())
        }
    }
}

/// Exclusive lock on the data directory enforcing the process singleton.
/// Held for the lifetime of the daemon; dropping it releases the lock.
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    pub fn acquire(paths: &Paths) -> Result<Self> {
        let lock_path = paths.lock_file();
        let file = File::create(&lock_path)
            .with_context(|| format!("cannot create lock file {}", lock_path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "another starsrv instance is already running (lock held on {})",
                lock_path.display()
            );
        }
        debug!("acquired instance lock at {}", lock_path.display());
        Ok(Self { _file: file })
    }
}

/// Expand a leading `~` or `~/` against the user's home directory. Paths
/// without a tilde are returned cleaned but otherwise untouched.
pub fn expand_home_dir(path: &str) -> Result<PathBuf> {
    if path == "~" {
        return Ok(home_dir());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        let expanded = home_dir().join(rest);
        if !expanded.starts_with(home_dir()) {
            bail!("potential path traversal detected for path {path:?}");
        }
        return Ok(expanded);
    }
    Ok(PathBuf::from(path))
}

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}

/// Validate an (os, arch) pair against the shipped agent binaries. Accepts
/// the uname spellings amd64 and aarch64 and normalizes them.
pub fn validate_wsh_platform(os: &str, arch: &str) -> Result<(String, String)> {
    let arch = match arch {
        "amd64" | "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    let tuple = format!("{os}-{arch}");
    if !SUPPORTED_WSH_PLATFORMS.contains(&tuple.as_str()) {
        bail!("unsupported wsh platform: {tuple}");
    }
    Ok((os.to_string(), arch.to_string()))
}

/// File name of the bundled wsh binary for a platform tuple.
pub fn wsh_binary_name(version: &str, os: &str, arch: &str) -> String {
    let ext = if os == "windows" { ".exe" } else { "" };
    format!("wsh-{version}-{os}-{arch}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_wsh_platform_normalizes_arch() {
        let (os, arch) = validate_wsh_platform("linux", "amd64").unwrap();
        assert_eq!(os, "linux");
        assert_eq!(arch, "x64");

        let (_, arch) = validate_wsh_platform("darwin", "aarch64").unwrap();
        assert_eq!(arch, "arm64");
    }

    #[test]
    fn test_validate_wsh_platform_rejects_unknown() {
        assert!(validate_wsh_platform("plan9", "x64").is_err());
        assert!(validate_wsh_platform("linux", "riscv64").is_err());
    }

    #[test]
    fn test_wsh_binary_name() {
        assert_eq!(
            wsh_binary_name("0.1.0", "linux", "x64"),
            "wsh-0.1.0-linux-x64"
        );
        assert_eq!(
            wsh_binary_name("0.1.0", "windows", "arm64"),
            "wsh-0.1.0-windows-arm64.exe"
        );
    }

    #[test]
    fn test_expand_home_dir() {
        let home = home_dir();
        assert_eq!(expand_home_dir("~").unwrap(), home);
        assert_eq!(expand_home_dir("~/x/y").unwrap(), home.join("x/y"));
        assert_eq!(
            expand_home_dir("/absolute/path").unwrap(),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path(), tmp.path().join("config"));
        let first = InstanceLock::acquire(&paths).unwrap();
        assert!(InstanceLock::acquire(&paths).is_err());
        drop(first);
        assert!(InstanceLock::acquire(&paths).is_ok());
    }
}
