//! Cooperative shutdown: signals and parent-death detection feed a single
//! shutdown path guarded by a one-shot latch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use tokio::io::AsyncReadExt;

use crate::App;

static SHUTDOWN_ONCE: AtomicBool = AtomicBool::new(false);

/// Run the shutdown sequence exactly once, then exit.
pub async fn do_shutdown(app: Arc<App>, reason: &str) {
    if SHUTDOWN_ONCE.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("shutting down ({reason})");
    app.config.stop();
    if let Err(e) = app.store.blob().flush().await {
        error!("error flushing blob store: {e:#}");
    }
    let _ = std::fs::remove_file(app.paths.domain_socket());
    std::process::exit(0);
}

/// Install the signal handlers and the stdin-EOF watcher (the launching
/// process closing our stdin means the parent died).
pub fn install_handlers(app: Arc<App>) {
    let sig_app = app.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                do_shutdown(sig_app, "SIGINT").await;
            }
            _ = sigterm.recv() => {
                do_shutdown(sig_app, "SIGTERM").await;
            }
        }
    });

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        do_shutdown(app, "stdin EOF").await;
    });
}
