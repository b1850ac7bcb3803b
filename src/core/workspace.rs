//! Workspace and tab operations.

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::obj::{LayoutState, ORef, OTYPE_WORKSPACE, Tab, Workspace};
use crate::pubsub::{Broker, EVENT_WORKSPACE_UPDATE, StarEvent};
use crate::store::StoreTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceListEntry {
    #[serde(rename = "workspaceid")]
    pub workspace_id: String,
    #[serde(rename = "windowid", default, skip_serializing_if = "String::is_empty")]
    pub window_id: String,
}

pub async fn create_workspace(
    tx: &mut StoreTx,
    name: &str,
    icon: &str,
    color: &str,
    apply_defaults: bool,
    is_initial: bool,
) -> Result<Workspace> {
    let ws = Workspace {
        oid: Uuid::new_v4().to_string(),
        name: name.to_string(),
        icon: icon.to_string(),
        color: color.to_string(),
        ..Default::default()
    };
    tx.insert_obj(ws.clone()).await?;
    if apply_defaults || is_initial {
        create_tab(tx, &ws.oid, "", true, false).await?;
    }
    tx.get_workspace(&ws.oid).await.context("reloading workspace")
}

/// Update name/icon/color; empty strings leave the field untouched unless
/// `apply_defaults` forces icon/color defaults for a newly named workspace.
pub async fn update_workspace(
    tx: &mut StoreTx,
    workspace_id: &str,
    name: &str,
    icon: &str,
    color: &str,
    apply_defaults: bool,
) -> Result<(Workspace, bool)> {
    let mut ws = tx.get_workspace(workspace_id).await?;
    let mut updated = false;
    if !name.is_empty() && name != ws.name {
        ws.name = name.to_string();
        updated = true;
    }
    if !icon.is_empty() && icon != ws.icon {
        ws.icon = icon.to_string();
        updated = true;
    }
    if !color.is_empty() && color != ws.color {
        ws.color = color.to_string();
        updated = true;
    }
    if apply_defaults {
        if ws.icon.is_empty() {
            ws.icon = super::WORKSPACE_ICONS[0].to_string();
            updated = true;
        }
        if ws.color.is_empty() {
            ws.color = super::WORKSPACE_COLORS[0].to_string();
            updated = true;
        }
    }
    if updated {
        tx.update_obj(ws.clone()).await?;
        ws = tx.get_workspace(workspace_id).await?;
    }
    Ok((ws, updated))
}

/// Delete a workspace and everything under it. A named workspace is never
/// deleted unless `force` is set; instead its id is reported as claimable so
/// a new window can adopt it.
pub async fn delete_workspace(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    workspace_id: &str,
    force: bool,
) -> Result<(bool, String)> {
    let ws = tx.get_workspace(workspace_id).await?;
    if !ws.name.is_empty() && !force {
        debug!("workspace {workspace_id} is named, not deleting (claimable)");
        return Ok((false, workspace_id.to_string()));
    }
    for tab_id in ws.all_tab_ids() {
        delete_tab_inner(tx, broker, controllers, workspace_id, &tab_id).await?;
    }
    tx.delete(OTYPE_WORKSPACE, workspace_id).await?;
    info!("deleted workspace {workspace_id}");
    Ok((true, String::new()))
}

pub async fn list_workspaces(tx: &mut StoreTx) -> Result<Vec<WorkspaceListEntry>> {
    let mut rtn = Vec::new();
    for ws_id in tx.get_all_oids(OTYPE_WORKSPACE).await? {
        let window_id = match tx.find_window_for_workspace(&ws_id).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e.into()),
        };
        rtn.push(WorkspaceListEntry {
            workspace_id: ws_id,
            window_id,
        });
    }
    Ok(rtn)
}

/// Create a tab (with its layout state) in a workspace. Returns the tab id.
pub async fn create_tab(
    tx: &mut StoreTx,
    workspace_id: &str,
    tab_name: &str,
    activate: bool,
    pinned: bool,
) -> Result<String> {
    let mut ws = tx.get_workspace(workspace_id).await?;
    let name = if tab_name.is_empty() {
        format!("T{}", ws.tab_ids.len() + ws.pinned_tab_ids.len() + 1)
    } else {
        tab_name.to_string()
    };
    let layout = LayoutState {
        oid: Uuid::new_v4().to_string(),
        ..Default::default()
    };
    tx.insert_obj(layout.clone()).await?;
    let tab = Tab {
        oid: Uuid::new_v4().to_string(),
        name,
        layout_state: layout.oid.clone(),
        ..Default::default()
    };
    tx.insert_obj(tab.clone()).await?;
    if pinned {
        ws.pinned_tab_ids.push(tab.oid.clone());
    } else {
        ws.tab_ids.push(tab.oid.clone());
    }
    if activate || ws.active_tab_id.is_empty() {
        ws.active_tab_id = tab.oid.clone();
    }
    tx.update_obj(ws).await?;
    Ok(tab.oid)
}

/// Delete a tab, its blocks, and its layout state; pick the next active tab.
/// Returns the new active tab id (empty when the workspace has no tabs left).
pub async fn delete_tab(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    workspace_id: &str,
    tab_id: &str,
) -> Result<String> {
    let ws = tx.get_workspace(workspace_id).await?;
    if !ws.all_tab_ids().iter().any(|id| id == tab_id) {
        bail!("tab {tab_id:?} not in workspace {workspace_id:?}");
    }
    delete_tab_inner(tx, broker, controllers, workspace_id, tab_id).await?;

    let mut ws = tx.get_workspace(workspace_id).await?;
    let remaining = ws.all_tab_ids();
    let new_active = if ws.active_tab_id == tab_id || ws.active_tab_id.is_empty() {
        remaining.first().cloned().unwrap_or_default()
    } else {
        ws.active_tab_id.clone()
    };
    if ws.active_tab_id != new_active {
        ws.active_tab_id = new_active.clone();
        tx.update_obj(ws).await?;
    }
    Ok(new_active)
}

async fn delete_tab_inner(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    workspace_id: &str,
    tab_id: &str,
) -> Result<()> {
    let tab = tx.get_tab(tab_id).await?;
    for block_id in tab.block_ids.clone() {
        super::block::delete_block_tree(tx, broker, controllers, &block_id).await?;
    }
    if !tab.layout_state.is_empty() {
        tx.delete(crate::obj::OTYPE_LAYOUT, &tab.layout_state).await?;
    }
    tx.delete(crate::obj::OTYPE_TAB, tab_id).await?;

    let mut ws = tx.get_workspace(workspace_id).await?;
    ws.tab_ids.retain(|id| id != tab_id);
    ws.pinned_tab_ids.retain(|id| id != tab_id);
    if ws.active_tab_id == tab_id {
        ws.active_tab_id = String::new();
    }
    tx.update_obj(ws).await?;
    Ok(())
}

pub async fn set_active_tab(tx: &mut StoreTx, workspace_id: &str, tab_id: &str) -> Result<()> {
    let mut ws = tx.get_workspace(workspace_id).await?;
    if !tab_id.is_empty() && !ws.all_tab_ids().iter().any(|id| id == tab_id) {
        bail!("tab {tab_id:?} not in workspace {workspace_id:?}");
    }
    ws.active_tab_id = tab_id.to_string();
    tx.update_obj(ws).await?;
    Ok(())
}

pub async fn change_tab_pinning(
    tx: &mut StoreTx,
    workspace_id: &str,
    tab_id: &str,
    pinned: bool,
) -> Result<()> {
    let mut ws = tx.get_workspace(workspace_id).await?;
    if !ws.all_tab_ids().iter().any(|id| id == tab_id) {
        bail!("tab {tab_id:?} not in workspace {workspace_id:?}");
    }
    ws.tab_ids.retain(|id| id != tab_id);
    ws.pinned_tab_ids.retain(|id| id != tab_id);
    if pinned {
        ws.pinned_tab_ids.push(tab_id.to_string());
    } else {
        ws.tab_ids.insert(0, tab_id.to_string());
    }
    tx.update_obj(ws).await?;
    Ok(())
}

/// Replace the tab ordering wholesale. The two lists must stay disjoint and
/// cover exactly the workspace's existing tabs.
pub async fn update_workspace_tab_ids(
    tx: &mut StoreTx,
    workspace_id: &str,
    tab_ids: &[String],
    pinned_tab_ids: &[String],
) -> Result<()> {
    let mut ws = tx.get_workspace(workspace_id).await?;
    for pinned in pinned_tab_ids {
        if tab_ids.contains(pinned) {
            bail!("tab {pinned:?} cannot be both pinned and unpinned");
        }
    }
    let mut existing = ws.all_tab_ids();
    existing.sort();
    let mut incoming: Vec<String> = tab_ids
        .iter()
        .chain(pinned_tab_ids.iter())
        .cloned()
        .collect();
    incoming.sort();
    incoming.dedup();
    if existing != incoming {
        bail!("tab id lists do not match workspace tabs");
    }
    ws.tab_ids = tab_ids.to_vec();
    ws.pinned_tab_ids = pinned_tab_ids.to_vec();
    if !ws.active_tab_id.is_empty() && !ws.all_tab_ids().contains(&ws.active_tab_id) {
        ws.active_tab_id = ws.all_tab_ids().first().cloned().unwrap_or_default();
    }
    tx.update_obj(ws).await?;
    Ok(())
}

/// Announce a workspace's new active tab so attached windows can react.
pub fn send_active_tab_update(broker: &Broker, workspace_id: &str, new_active_tab_id: &str) {
    broker.publish(StarEvent {
        event: EVENT_WORKSPACE_UPDATE.to_string(),
        sender: String::new(),
        scopes: vec![ORef::new(OTYPE_WORKSPACE, workspace_id).to_string()],
        data: Some(serde_json::json!({
            "workspaceid": workspace_id,
            "newactivetabid": new_active_tab_id,
        })),
    });
}
