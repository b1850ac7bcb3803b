use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info};

use starsrv::base::{InstanceLock, Paths};
use starsrv::shutdown;
use starsrv::{App, core, service, shell, telemetry, ws};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);
    match cli.command {
        Command::Serve(cmd) => serve_main(cmd),
        Command::Paths => print_paths(),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "starsrv - Starterm terminal workspace daemon.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon
    Serve(ServeCommand),
    /// Print the resolved data and config directories
    Paths,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address for the UI websocket listener
    #[arg(long, default_value = "127.0.0.1:61269")]
    ws_addr: String,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.quiet {
        LevelFilter::Error
    } else if common.trace {
        LevelFilter::Trace
    } else if common.debug || common.verbose >= 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn print_paths() -> Result<()> {
    let paths = Paths::from_env()?;
    println!("data:   {}", paths.data_dir.display());
    println!("config: {}", paths.config_dir.display());
    Ok(())
}

#[tokio::main]
async fn serve_main(cmd: ServeCommand) -> Result<()> {
    let paths = Paths::from_env()?;
    paths.ensure_dirs()?;
    debug!("resolved paths: {paths:?}");

    // exactly one daemon per data dir
    let _lock = InstanceLock::acquire(&paths).context("startup failed")?;

    let app = App::init(paths.clone(), &load_jwt_secret(&paths)?).await?;
    service::validate_service_map()?;

    let client = core::ensure_initial_data(&app.store).await?;
    info!(
        "starsrv v{} (client {})",
        starsrv::base::STAR_VERSION,
        client.oid
    );

    shell::init_rc_files(&paths)?;
    shell::install_local_wsh_binary(&paths)?;
    app.config.start()?;
    shutdown::install_handlers(app.clone());

    // telemetry flush runs on a coarse tick against a next-send timestamp
    let flush_app = app.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            telemetry::FLUSH_TICK_SECS,
        ));
        loop {
            tick.tick().await;
            flush_app.telemetry.maybe_flush();
        }
    });

    let sock_app = app.clone();
    let sock_path = paths.domain_socket();
    tokio::spawn(async move {
        if let Err(e) = starsrv::rpc::run_domain_socket_listener(
            &sock_path,
            sock_app.router.clone(),
            sock_app.broker.clone(),
        )
        .await
        {
            log::error!("domain socket listener failed: {e:#}");
        }
    });

    debug!("ui auth key: {}", app.ui.auth_key());
    ws::run_websocket_listener(&cmd.ws_addr, app).await
}

/// The JWT signing secret lives in the data dir; generated on first run.
fn load_jwt_secret(paths: &Paths) -> Result<Vec<u8>> {
    let path = paths.data_dir.join("star.secret");
    match std::fs::read(&path) {
        Ok(secret) if !secret.is_empty() => Ok(secret),
        _ => {
            let secret = starsrv::rpc::make_auth_token().into_bytes();
            std::fs::write(&path, &secret)
                .with_context(|| format!("writing jwt secret to {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(secret)
        }
    }
}
