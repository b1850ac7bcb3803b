//! Workspace and tab operations.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use super::{MethodDesc, MethodResult, ServiceDesc, WebCall, convert};
use crate::App;
use crate::core;
use crate::obj::{StarObj, UpdateRecord};

pub const DESC: ServiceDesc = ServiceDesc {
    name: "workspace",
    methods: &[
        MethodDesc {
            name: "CreateWorkspace",
            arg_names: &["name", "icon", "color", "applyDefaults"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "UpdateWorkspace",
            arg_names: &["workspaceId", "name", "icon", "color", "applyDefaults"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetWorkspace",
            arg_names: &["workspaceId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "DeleteWorkspace",
            arg_names: &["workspaceId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "ListWorkspaces",
            arg_names: &[],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "CreateTab",
            arg_names: &["workspaceId", "tabName", "activateTab", "pinned"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "ChangeTabPinning",
            arg_names: &["workspaceId", "tabId", "pinned"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "UpdateTabIds",
            arg_names: &["workspaceId", "tabIds", "pinnedTabIds"],
            needs_ui_context: true,
        },
        MethodDesc {
            name: "SetActiveTab",
            arg_names: &["workspaceId", "tabId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "CloseTab",
            arg_names: &["workspaceId", "tabId", "fromElectron"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetColors",
            arg_names: &[],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetIcons",
            arg_names: &[],
            needs_ui_context: false,
        },
    ],
};

pub async fn create_workspace(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let name = convert::arg_str(&call.args, 0, "name")?;
    let icon = convert::arg_str(&call.args, 1, "icon")?;
    let color = convert::arg_str(&call.args, 2, "color")?;
    let apply_defaults = convert::arg_bool(&call.args, 3, "applyDefaults")?;
    let mut tx = app.store.begin().await?;
    let ws = core::create_workspace(&mut tx, &name, &icon, &color, apply_defaults, false)
        .await
        .context("error creating workspace")?;
    let updates = tx.commit().await?;
    Ok((Some(json!(ws.oid)), updates))
}

pub async fn update_workspace(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let name = convert::arg_str(&call.args, 1, "name")?;
    let icon = convert::arg_str(&call.args, 2, "icon")?;
    let color = convert::arg_str(&call.args, 3, "color")?;
    let apply_defaults = convert::arg_bool(&call.args, 4, "applyDefaults")?;
    let mut tx = app.store.begin().await?;
    let (_ws, updated) = core::update_workspace(
        &mut tx,
        &workspace_id,
        &name,
        &icon,
        &color,
        apply_defaults,
    )
    .await
    .context("error updating workspace")?;
    let updates = tx.commit().await?;
    if !updated {
        return Ok((None, Vec::new()));
    }
    app.broker.publish(crate::pubsub::StarEvent {
        event: crate::pubsub::EVENT_WORKSPACE_UPDATE.to_string(),
        ..Default::default()
    });
    Ok((None, updates))
}

pub async fn get_workspace(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let mut tx = app.store.begin().await?;
    let ws = tx
        .get_workspace(&workspace_id)
        .await
        .context("error getting workspace")?;
    tx.commit().await?;
    Ok((Some(serde_json::to_value(StarObj::from(ws))?), Vec::new()))
}

pub async fn delete_workspace(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let mut tx = app.store.begin().await?;
    let (deleted, claimable) = core::delete_workspace(
        &mut tx,
        &app.broker,
        app.controllers.as_ref(),
        &workspace_id,
        false,
    )
    .await
    .context("error deleting workspace")?;
    let updates = tx.commit().await?;
    if !claimable.is_empty() {
        return Ok((Some(json!({ "claimableworkspace": claimable })), Vec::new()));
    }
    if !deleted {
        return Ok((None, Vec::new()));
    }
    Ok((None, updates))
}

pub async fn list_workspaces(app: &Arc<App>, _call: &WebCall) -> MethodResult {
    let mut tx = app.store.begin().await?;
    let list = core::list_workspaces(&mut tx).await?;
    tx.commit().await?;
    Ok((Some(serde_json::to_value(list)?), Vec::new()))
}

pub async fn create_tab(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let tab_name = convert::arg_str(&call.args, 1, "tabName")?;
    let activate = convert::arg_bool(&call.args, 2, "activateTab")?;
    let pinned = convert::arg_bool(&call.args, 3, "pinned")?;
    let mut tx = app.store.begin().await?;
    let tab_id = core::create_tab(&mut tx, &workspace_id, &tab_name, activate, pinned)
        .await
        .context("error creating tab")?;
    core::apply_portable_layout(&mut tx, &tab_id, core::new_tab_layout()).await?;
    let updates = tx.commit().await?;
    Ok((Some(json!(tab_id)), updates))
}

pub async fn change_tab_pinning(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let tab_id = convert::arg_str(&call.args, 1, "tabId")?;
    let pinned = convert::arg_bool(&call.args, 2, "pinned")?;
    let mut tx = app.store.begin().await?;
    core::change_tab_pinning(&mut tx, &workspace_id, &tab_id, pinned)
        .await
        .context("error toggling tab pinning")?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

pub async fn update_tab_ids(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let tab_ids = convert::arg_str_vec(&call.args, 1, "tabIds")?;
    let pinned_tab_ids = convert::arg_str_vec(&call.args, 2, "pinnedTabIds")?;
    let mut tx = app.store.begin().await?;
    core::update_workspace_tab_ids(&mut tx, &workspace_id, &tab_ids, &pinned_tab_ids)
        .await
        .context("error updating workspace tab ids")?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

/// Update the workspace pointer; the returned updates also include the tab
/// and all of its blocks so the UI can hydrate immediately.
pub async fn set_active_tab(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let tab_id = convert::arg_str(&call.args, 1, "tabId")?;
    let mut tx = app.store.begin().await?;
    core::set_active_tab(&mut tx, &workspace_id, &tab_id)
        .await
        .context("error setting active tab")?;
    let tab = tx.get_tab(&tab_id).await.context("error getting tab")?;
    let blocks = tx
        .select_orefs(&tab.block_orefs())
        .await
        .context("error getting tab blocks")?;
    let updates = tx.commit().await?;

    let mut extra = updates;
    extra.push(UpdateRecord::update(&StarObj::from(tab)));
    for block in &blocks {
        extra.push(UpdateRecord::update(block));
    }
    Ok((None, extra))
}

/// Close a tab: stop its block controllers, delete it, and report either
/// the new active tab or that the window should close.
pub async fn close_tab(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let workspace_id = convert::arg_str(&call.args, 0, "workspaceId")?;
    let tab_id = convert::arg_str(&call.args, 1, "tabId")?;
    let _from_electron = convert::arg_bool(&call.args, 2, "fromElectron").unwrap_or(false);
    let mut tx = app.store.begin().await?;
    let tab = tx.get_tab(&tab_id).await.context("error getting tab")?;
    for block_id in &tab.block_ids {
        app.controllers.stop_controller(block_id);
    }
    let new_active_tab_id = core::delete_tab(
        &mut tx,
        &app.broker,
        app.controllers.as_ref(),
        &workspace_id,
        &tab_id,
    )
    .await
    .context("error closing tab")?;
    let updates = tx.commit().await?;
    let rtn = if new_active_tab_id.is_empty() {
        json!({ "closewindow": true })
    } else {
        json!({ "newactivetabid": new_active_tab_id })
    };
    core::send_active_tab_update(&app.broker, &workspace_id, &new_active_tab_id);
    Ok((Some(rtn), updates))
}

pub async fn get_colors(_app: &Arc<App>, _call: &WebCall) -> MethodResult {
    Ok((Some(json!(core::WORKSPACE_COLORS)), Vec::new()))
}

pub async fn get_icons(_app: &Arc<App>, _call: &WebCall) -> MethodResult {
    Ok((Some(json!(core::WORKSPACE_ICONS)), Vec::new()))
}
