//! Window operations, including the cross-window block move.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use super::{MethodDesc, MethodResult, ServiceDesc, WebCall, convert};
use crate::App;
use crate::core;
use crate::obj::{Point, StarObj, WinSize};

/// How long MoveBlockToNewWindow waits for the UI host to materialize the
/// new window.
const NEW_WINDOW_WAIT: Duration = Duration::from_secs(2);

pub const DESC: ServiceDesc = ServiceDesc {
    name: "window",
    methods: &[
        MethodDesc {
            name: "GetWindow",
            arg_names: &["windowId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "CreateWindow",
            arg_names: &["winSize", "workspaceId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "SetWindowPosAndSize",
            arg_names: &["windowId", "pos", "size"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "MoveBlockToNewWindow",
            arg_names: &["currentTabId", "blockId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "SwitchWorkspace",
            arg_names: &["windowId", "workspaceId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "CloseWindow",
            arg_names: &["windowId", "fromElectron"],
            needs_ui_context: false,
        },
    ],
};

pub async fn get_window(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let window_id = convert::arg_str(&call.args, 0, "windowId")?;
    let mut tx = app.store.begin().await?;
    let window = tx.get_window(&window_id).await.context("error getting window")?;
    tx.commit().await?;
    Ok((
        Some(serde_json::to_value(StarObj::from(window))?),
        Vec::new(),
    ))
}

pub async fn create_window(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let win_size: Option<WinSize> = convert::arg_struct_opt(&call.args, 0, "winSize")?;
    let workspace_id = convert::arg_str(&call.args, 1, "workspaceId").unwrap_or_default();
    let mut tx = app.store.begin().await?;
    let window = core::create_window(&mut tx, win_size, &workspace_id)
        .await
        .context("error creating window")?;
    let updates = tx.commit().await?;
    Ok((
        Some(serde_json::to_value(StarObj::from(window))?),
        updates,
    ))
}

pub async fn set_window_pos_and_size(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let window_id = convert::arg_str(&call.args, 0, "windowId")?;
    let pos: Option<Point> = convert::arg_struct_opt(&call.args, 1, "pos")?;
    let size: Option<WinSize> = convert::arg_struct_opt(&call.args, 2, "size")?;
    if pos.is_none() && size.is_none() {
        return Ok((None, Vec::new()));
    }
    let mut tx = app.store.begin().await?;
    let mut window = tx.get_window(&window_id).await?;
    if let Some(pos) = pos {
        window.pos = pos;
    }
    if let Some(size) = size {
        window.win_size = size;
    }
    window.is_new = false;
    tx.update_obj(window).await?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

/// Create a fresh window (with its own workspace and tab), wait for the UI
/// host to materialize it, then move the block across.
pub async fn move_block_to_new_window(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let current_tab_id = convert::arg_str(&call.args, 0, "currentTabId")?;
    let block_id = convert::arg_str(&call.args, 1, "blockId")?;

    let mut tx = app.store.begin().await?;
    let tab = tx.get_tab(&current_tab_id).await.context("error getting tab")?;
    if !tab.block_ids.iter().any(|id| id == &block_id) {
        bail!("block not found in current tab");
    }
    let window = core::create_window(&mut tx, None, "")
        .await
        .context("error creating window")?;
    let workspace = tx.get_workspace(&window.workspace_id).await?;
    let mut updates = tx.commit().await?;

    app.ui.request_new_window(&app.broker, &window.oid);
    if !app.ui.wait_for_window(&window.oid, NEW_WINDOW_WAIT).await {
        bail!("new window not created");
    }

    let mut tx = app.store.begin().await?;
    tx.move_block_to_tab(&current_tab_id, &workspace.active_tab_id, &block_id)
        .await
        .context("error moving block to tab")?;
    core::queue_layout_action_for_tab(
        &mut tx,
        &current_tab_id,
        vec![crate::obj::LayoutActionData {
            action_type: core::ACTION_REMOVE.to_string(),
            block_id: block_id.clone(),
            ..Default::default()
        }],
    )
    .await?;
    core::queue_layout_action_for_tab(
        &mut tx,
        &workspace.active_tab_id,
        vec![crate::obj::LayoutActionData {
            action_type: core::ACTION_INSERT.to_string(),
            block_id: block_id.clone(),
            focused: true,
            ..Default::default()
        }],
    )
    .await?;
    updates.extend(tx.commit().await?);
    Ok((None, updates))
}

pub async fn switch_workspace(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let window_id = convert::arg_str(&call.args, 0, "windowId")?;
    let workspace_id = convert::arg_str(&call.args, 1, "workspaceId")?;
    let mut tx = app.store.begin().await?;
    let ws = core::switch_workspace(
        &mut tx,
        &app.broker,
        app.controllers.as_ref(),
        &window_id,
        &workspace_id,
    )
    .await?;
    let updates = tx.commit().await?;
    Ok((Some(serde_json::to_value(StarObj::from(ws))?), updates))
}

pub async fn close_window(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let window_id = convert::arg_str(&call.args, 0, "windowId")?;
    let _from_electron = convert::arg_bool(&call.args, 1, "fromElectron").unwrap_or(false);
    let mut tx = app.store.begin().await?;
    core::close_window(
        &mut tx,
        &app.broker,
        app.controllers.as_ref(),
        &window_id,
    )
    .await?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}
