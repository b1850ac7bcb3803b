//! Shell integration: per-shell rc snippets written under the data dir and
//! sourced by shells the daemon launches. Each snippet prepends the wsh bin
//! directory to PATH and sources a dynamic init script fetched through a
//! one-shot swap token.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::base::{BIN_DIR, JWT_ENV, Paths, STAR_VERSION, SWAP_TOKEN_ENV, wsh_binary_name};

pub const SHELL_TYPE_BASH: &str = "bash";
pub const SHELL_TYPE_ZSH: &str = "zsh";
pub const SHELL_TYPE_FISH: &str = "fish";
pub const SHELL_TYPE_PWSH: &str = "pwsh";
pub const SHELL_TYPE_UNKNOWN: &str = "unknown";

pub const DEFAULT_SHELL_PATH: &str = "/bin/bash";

const ZSH_DIR: &str = "zsh";
const BASH_DIR: &str = "bash";
const FISH_DIR: &str = "fish";
const PWSH_DIR: &str = "pwsh";

const ZSH_ZPROFILE: &str = r#"
# Source the original zprofile
[ -f ~/.zprofile ] && source ~/.zprofile
"#;

const ZSH_ZSHRC: &str = r#"
# add wsh to path, source dynamic script from wsh token
STARTERM_WSHBINDIR={{WSHBINDIR}}
export PATH="$STARTERM_WSHBINDIR:$PATH"
source <(wsh token "$STARTERM_SWAPTOKEN" zsh 2>/dev/null)
unset STARTERM_SWAPTOKEN

# Source the original zshrc only if ZDOTDIR has not been changed
if [ "$ZDOTDIR" = "$STARTERM_ZDOTDIR" ]; then
  [ -f ~/.zshrc ] && source ~/.zshrc
fi

if [[ ":$PATH:" != *":$STARTERM_WSHBINDIR:"* ]]; then
  export PATH="$STARTERM_WSHBINDIR:$PATH"
fi
unset STARTERM_WSHBINDIR
"#;

const ZSH_ZLOGIN: &str = r#"
# Source the original zlogin
[ -f ~/.zlogin ] && source ~/.zlogin

# Unset ZDOTDIR only if it hasn't been modified
if [ "$ZDOTDIR" = "$STARTERM_ZDOTDIR" ]; then
  unset ZDOTDIR
fi
"#;

const ZSH_ZSHENV: &str = r#"
# Store the initial ZDOTDIR value
STARTERM_ZDOTDIR="$ZDOTDIR"

# Source the original zshenv
[ -f ~/.zshenv ] && source ~/.zshenv

# Detect if ZDOTDIR has changed
if [ "$ZDOTDIR" != "$STARTERM_ZDOTDIR" ]; then
  [ -f "$STARTERM_ZDOTDIR/.zshrc" ] && source "$STARTERM_ZDOTDIR/.zshrc"
fi
"#;

const BASH_BASHRC: &str = r#"
# Source /etc/profile if it exists
if [ -f /etc/profile ]; then
    . /etc/profile
fi

STARTERM_WSHBINDIR={{WSHBINDIR}}

# after /etc/profile which is likely to clobber the path
export PATH="$STARTERM_WSHBINDIR:$PATH"

# Source the dynamic script from wsh token
eval "$(wsh token "$STARTERM_SWAPTOKEN" bash 2> /dev/null)"
unset STARTERM_SWAPTOKEN

# Source the first of ~/.bash_profile, ~/.bash_login, or ~/.profile that exists
if [ -f ~/.bash_profile ]; then
    . ~/.bash_profile
elif [ -f ~/.bash_login ]; then
    . ~/.bash_login
elif [ -f ~/.profile ]; then
    . ~/.profile
fi

if [[ ":$PATH:" != *":$STARTERM_WSHBINDIR:"* ]]; then
    export PATH="$STARTERM_WSHBINDIR:$PATH"
fi
unset STARTERM_WSHBINDIR
"#;

const FISH_STARFISH: &str = r#"
# this file is sourced with -C
# Add Star binary directory to PATH
set -x PATH {{WSHBINDIR}} $PATH

# Source dynamic script from wsh token
wsh token "$STARTERM_SWAPTOKEN" fish 2>/dev/null | source
set -e STARTERM_SWAPTOKEN
"#;

const PWSH_STARPWSH: &str = r#"
# We source this file with -NoExit -File
$env:PATH = {{WSHBINDIR_PWSH}} + "{{PATHSEP}}" + $env:PATH

# Source dynamic script from wsh token
$starterm_swaptoken_output = wsh token $env:STARTERM_SWAPTOKEN pwsh 2>$null | Out-String
if ($starterm_swaptoken_output -and $starterm_swaptoken_output -ne "") {
    Invoke-Expression $starterm_swaptoken_output
}
Remove-Variable -Name starterm_swaptoken_output
Remove-Item Env:STARTERM_SWAPTOKEN
"#;

fn render_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Single-quote a path for POSIX shells.
pub fn hard_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Single-quote a path for PowerShell.
pub fn hard_quote_powershell(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn shell_type_from_path(shell_path: &str) -> &'static str {
    let base = Path::new(shell_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if base.contains("bash") {
        SHELL_TYPE_BASH
    } else if base.contains("zsh") {
        SHELL_TYPE_ZSH
    } else if base.contains("fish") {
        SHELL_TYPE_FISH
    } else if base.contains("pwsh") || base.contains("powershell") {
        SHELL_TYPE_PWSH
    } else {
        SHELL_TYPE_UNKNOWN
    }
}

pub fn detect_local_shell_path() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL_PATH.to_string())
}

pub fn zsh_zdotdir(paths: &Paths) -> PathBuf {
    paths.shell_dir().join(ZSH_DIR)
}

pub fn bash_rc_override(paths: &Paths) -> PathBuf {
    paths.shell_dir().join(BASH_DIR).join(".bashrc")
}

/// Write every rc snippet under `<data>/shell/...` with the wsh bin dir
/// substituted in, hard-quoted per shell.
pub fn init_rc_files(paths: &Paths) -> Result<()> {
    let bin_dir = paths.bin_dir();
    let bin_dir_str = bin_dir.display().to_string();
    let params: HashMap<&str, String> = HashMap::from([
        ("WSHBINDIR", hard_quote(&bin_dir_str)),
        ("WSHBINDIR_PWSH", hard_quote_powershell(&bin_dir_str)),
        ("PATHSEP", if cfg!(windows) { ";" } else { ":" }.to_string()),
    ]);

    let files: &[(&str, &str, &str)] = &[
        (ZSH_DIR, ".zprofile", ZSH_ZPROFILE),
        (ZSH_DIR, ".zshrc", ZSH_ZSHRC),
        (ZSH_DIR, ".zlogin", ZSH_ZLOGIN),
        (ZSH_DIR, ".zshenv", ZSH_ZSHENV),
        (BASH_DIR, ".bashrc", BASH_BASHRC),
        (FISH_DIR, "star.fish", FISH_STARFISH),
        (PWSH_DIR, "starpwsh.ps1", PWSH_STARPWSH),
    ];
    for (dir, name, template) in files {
        let dir_path = paths.shell_dir().join(dir);
        fs::create_dir_all(&dir_path)
            .with_context(|| format!("creating shell integration dir {dir}"))?;
        let rendered = render_template(template, &params);
        fs::write(dir_path.join(name), rendered)
            .with_context(|| format!("writing shell integration file {dir}/{name}"))?;
    }
    info!("shell startup files initialized under {}", paths.shell_dir().display());
    Ok(())
}

/// Copy the bundled wsh binary for the local platform into `<data>/bin/wsh`,
/// atomically (write-to-temp then rename). Missing bundles are non-fatal.
pub fn install_local_wsh_binary(paths: &Paths) -> Result<()> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let (os, arch) = match crate::base::validate_wsh_platform(
        if os == "macos" { "darwin" } else { os },
        arch,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("no bundled wsh binary for this platform: {e}");
            return Ok(());
        }
    };
    let src = paths
        .app_bin_dir()
        .join(wsh_binary_name(STAR_VERSION, &os, &arch));
    if !src.exists() {
        warn!("bundled wsh binary not found at {}", src.display());
        return Ok(());
    }
    let dst_dir = paths.data_dir.join(BIN_DIR);
    fs::create_dir_all(&dst_dir)?;
    let dst = dst_dir.join("wsh");
    let tmp = dst_dir.join("wsh.tmp");
    fs::copy(&src, &tmp).context("copying wsh binary")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755))?;
    }
    fs::rename(&tmp, &dst).context("installing wsh binary")?;
    info!("wsh binary installed at {}", dst.display());
    Ok(())
}

/// Prepare the launch environment for a shell attached to a block: a signed
/// connect token plus a fresh one-shot swap token carrying the init script.
/// The block controller (external) injects the returned map into the child
/// process; both tokens are consumed exactly once by the shell.
pub fn prepare_shell_launch(
    router: &crate::rpc::RpcRouter,
    paths: &Paths,
    ctx: crate::rpc::RpcContext,
    init_script: String,
    term_type: &str,
) -> Result<HashMap<String, String>> {
    let jwt = router.signer.make_token(&ctx)?;
    let base_env = starshell_env(paths, &jwt, "", term_type);
    let swap_token = router.swap_tokens.issue(ctx, base_env.clone(), init_script);
    let mut env = base_env;
    env.insert(SWAP_TOKEN_ENV.to_string(), swap_token);
    Ok(env)
}

/// Environment for a shell the daemon launches: the JWT and swap token plus
/// enough context to find the daemon again.
pub fn starshell_env(
    paths: &Paths,
    jwt: &str,
    swap_token: &str,
    term_type: &str,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if !term_type.is_empty() {
        env.insert("TERM".to_string(), term_type.to_string());
    }
    env.insert("TERM_PROGRAM".to_string(), "starterm".to_string());
    env.insert("STARTERM_VERSION".to_string(), STAR_VERSION.to_string());
    env.insert(
        "STARTERM_WSHBINDIR".to_string(),
        paths.bin_dir().display().to_string(),
    );
    env.insert(JWT_ENV.to_string(), jwt.to_string());
    env.insert(SWAP_TOKEN_ENV.to_string(), swap_token.to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let params = HashMap::from([("WSHBINDIR", "'/data/bin'".to_string())]);
        let out = render_template("export PATH={{WSHBINDIR}}:$PATH", &params);
        assert_eq!(out, "export PATH='/data/bin':$PATH");
    }

    #[test]
    fn test_hard_quote() {
        assert_eq!(hard_quote("/simple/path"), "'/simple/path'");
        assert_eq!(hard_quote("it's"), r"'it'\''s'");
        assert_eq!(hard_quote_powershell("it's"), "'it''s'");
    }

    #[test]
    fn test_shell_type_detection() {
        assert_eq!(shell_type_from_path("/bin/bash"), SHELL_TYPE_BASH);
        assert_eq!(shell_type_from_path("/usr/bin/zsh"), SHELL_TYPE_ZSH);
        assert_eq!(shell_type_from_path("/opt/fish"), SHELL_TYPE_FISH);
        assert_eq!(shell_type_from_path("pwsh.exe"), SHELL_TYPE_PWSH);
        assert_eq!(shell_type_from_path("/bin/dash"), SHELL_TYPE_UNKNOWN);
    }

    #[test]
    fn test_init_rc_files_writes_snippets() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        init_rc_files(&paths).unwrap();

        let zshrc = fs::read_to_string(paths.shell_dir().join("zsh/.zshrc")).unwrap();
        assert!(zshrc.contains("STARTERM_SWAPTOKEN"));
        assert!(zshrc.contains(&paths.bin_dir().display().to_string()));
        assert!(!zshrc.contains("{{WSHBINDIR}}"));

        for file in [
            "zsh/.zprofile",
            "zsh/.zlogin",
            "zsh/.zshenv",
            "bash/.bashrc",
            "fish/star.fish",
            "pwsh/starpwsh.ps1",
        ] {
            assert!(paths.shell_dir().join(file).exists(), "missing {file}");
        }
    }

    #[test]
    fn test_prepare_shell_launch_mints_one_shot_token() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        let broker = std::sync::Arc::new(crate::pubsub::Broker::new());
        let router =
            crate::rpc::RpcRouter::new(broker, crate::rpc::TokenSigner::new(b"secret"));
        let ctx = crate::rpc::RpcContext {
            block_id: "b1".into(),
            ..Default::default()
        };
        let env =
            prepare_shell_launch(&router, &paths, ctx, "echo init".into(), "xterm-256color")
                .unwrap();

        // the jwt identifies the block
        let jwt = env.get(JWT_ENV).unwrap();
        let back = router.signer.verify_token(jwt).unwrap();
        assert_eq!(back.block_id, "b1");

        // the swap token redeems exactly once and carries the init script
        let swap = env.get(SWAP_TOKEN_ENV).unwrap();
        let entry = router.swap_tokens.take(swap).unwrap();
        assert_eq!(entry.script_text, "echo init");
        assert_eq!(entry.rpc_context.block_id, "b1");
        assert!(router.swap_tokens.take(swap).is_err());
    }

    #[test]
    fn test_starshell_env_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        let env = starshell_env(&paths, "jwt-token", "swap-token", "xterm-256color");
        assert_eq!(env.get(JWT_ENV).unwrap(), "jwt-token");
        assert_eq!(env.get(SWAP_TOKEN_ENV).unwrap(), "swap-token");
        assert_eq!(env.get("TERM").unwrap(), "xterm-256color");
        assert_eq!(env.get("TERM_PROGRAM").unwrap(), "starterm");
    }
}
