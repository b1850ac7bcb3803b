//! Window lifecycle.

use anyhow::{Context, Result, bail};
use log::info;
use uuid::Uuid;

use crate::obj::{OTYPE_WINDOW, WinSize, Window, Workspace};
use crate::pubsub::Broker;
use crate::store::StoreTx;

const DEFAULT_WIN_WIDTH: i64 = 1400;
const DEFAULT_WIN_HEIGHT: i64 = 900;

/// Create a window. An empty `workspace_id` creates a fresh transient
/// (unnamed) workspace for the window to show.
pub async fn create_window(
    tx: &mut StoreTx,
    win_size: Option<WinSize>,
    workspace_id: &str,
) -> Result<Window> {
    let ws_id = if workspace_id.is_empty() {
        let ws = super::create_workspace(tx, "", "", "", true, false).await?;
        ws.oid
    } else {
        tx.get_workspace(workspace_id).await?.oid
    };
    let window = Window {
        oid: Uuid::new_v4().to_string(),
        workspace_id: ws_id,
        is_new: true,
        win_size: win_size.unwrap_or(WinSize {
            width: DEFAULT_WIN_WIDTH,
            height: DEFAULT_WIN_HEIGHT,
        }),
        ..Default::default()
    };
    tx.insert_obj(window.clone()).await?;

    let mut client = tx.get_client().await?;
    client.window_ids.push(window.oid.clone());
    tx.update_obj(client).await?;
    Ok(window)
}

/// Close a window. Its workspace is deleted if transient; a named workspace
/// survives and becomes claimable by the next window.
pub async fn close_window(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    window_id: &str,
) -> Result<()> {
    let window = tx.get_window(window_id).await?;
    if !window.workspace_id.is_empty() {
        let (deleted, claimable) = super::delete_workspace(
            tx,
            broker,
            controllers,
            &window.workspace_id,
            false,
        )
        .await?;
        if !deleted && !claimable.is_empty() {
            info!("workspace {claimable} left claimable after window close");
        }
    }
    let mut client = tx.get_client().await?;
    client.window_ids.retain(|id| id != window_id);
    tx.update_obj(client).await?;
    tx.delete(OTYPE_WINDOW, window_id).await?;
    Ok(())
}

/// Point a window at a different workspace. The previous workspace is
/// deleted when transient, otherwise left claimable.
pub async fn switch_workspace(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    window_id: &str,
    workspace_id: &str,
) -> Result<Workspace> {
    let mut window = tx.get_window(window_id).await?;
    if window.workspace_id == workspace_id {
        return Ok(tx.get_workspace(workspace_id).await?);
    }
    let target = tx.get_workspace(workspace_id).await?;
    match tx.find_window_for_workspace(workspace_id).await {
        Ok(other) if other != window_id => {
            bail!("workspace {workspace_id:?} is already open in another window");
        }
        _ => {}
    }
    let old_workspace_id = window.workspace_id.clone();
    window.workspace_id = workspace_id.to_string();
    tx.update_obj(window).await?;
    if !old_workspace_id.is_empty() {
        super::delete_workspace(tx, broker, controllers, &old_workspace_id, false)
            .await
            .context("cleaning up previous workspace")?;
    }
    Ok(target)
}
