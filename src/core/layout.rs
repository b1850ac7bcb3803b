//! Layout action queue and the seeded layouts.
//!
//! The daemon never interprets layout actions; it queues them on a tab's
//! layout state for the UI to drain.

use anyhow::{Context, Result, bail};
use log::debug;

use crate::obj::{BlockDef, LayoutActionData, MetaMap, RuntimeOpts};
use crate::store::StoreTx;

pub const ACTION_INSERT: &str = "insert";
pub const ACTION_INSERT_AT_INDEX: &str = "insertatindex";
pub const ACTION_REMOVE: &str = "delete";
pub const ACTION_CLEAR_TREE: &str = "clear";
pub const ACTION_REPLACE: &str = "replace";
pub const ACTION_SPLIT_HORIZONTAL: &str = "splithorizontal";
pub const ACTION_SPLIT_VERTICAL: &str = "splitvertical";

#[derive(Debug, Clone)]
pub struct PortableLayoutEntry {
    pub index_arr: Vec<i64>,
    pub size: Option<u64>,
    pub block_def: BlockDef,
    pub focused: bool,
}

fn def(pairs: &[(&str, serde_json::Value)]) -> BlockDef {
    BlockDef {
        meta: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<MetaMap>(),
        ..Default::default()
    }
}

/// The layout seeded into a first-launch workspace.
pub fn starter_layout() -> Vec<PortableLayoutEntry> {
    use serde_json::json;
    vec![
        PortableLayoutEntry {
            index_arr: vec![0],
            size: None,
            block_def: def(&[("view", json!("term")), ("controller", json!("shell"))]),
            focused: true,
        },
        PortableLayoutEntry {
            index_arr: vec![1],
            size: None,
            block_def: def(&[("view", json!("sysinfo"))]),
            focused: false,
        },
        PortableLayoutEntry {
            index_arr: vec![1, 1],
            size: None,
            block_def: def(&[
                ("view", json!("web")),
                ("url", json!("https://github.com/commandlinedev/starterm")),
            ]),
            focused: false,
        },
        PortableLayoutEntry {
            index_arr: vec![1, 2],
            size: None,
            block_def: def(&[("view", json!("preview")), ("file", json!("~"))]),
            focused: false,
        },
        PortableLayoutEntry {
            index_arr: vec![2],
            size: None,
            block_def: def(&[("view", json!("tips"))]),
            focused: false,
        },
        PortableLayoutEntry {
            index_arr: vec![2, 1],
            size: None,
            block_def: def(&[("view", json!("help"))]),
            focused: false,
        },
        PortableLayoutEntry {
            index_arr: vec![2, 2],
            size: None,
            block_def: def(&[("view", json!("starai"))]),
            focused: false,
        },
    ]
}

/// The layout for a freshly created tab: a single shell terminal.
pub fn new_tab_layout() -> Vec<PortableLayoutEntry> {
    use serde_json::json;
    vec![PortableLayoutEntry {
        index_arr: vec![0],
        size: None,
        block_def: def(&[("view", json!("term")), ("controller", json!("shell"))]),
        focused: true,
    }]
}

pub async fn layout_id_for_tab(tx: &mut StoreTx, tab_id: &str) -> Result<String> {
    let tab = tx
        .get_tab(tab_id)
        .await
        .with_context(|| format!("unable to get layout id for tab {tab_id}"))?;
    Ok(tab.layout_state)
}

pub async fn queue_layout_action(
    tx: &mut StoreTx,
    layout_state_id: &str,
    actions: Vec<LayoutActionData>,
) -> Result<()> {
    let mut layout = tx
        .get_layout(layout_state_id)
        .await
        .with_context(|| format!("unable to get layout state {layout_state_id}"))?;
    layout.pending_backend_actions.extend(actions);
    tx.update_obj(layout).await?;
    Ok(())
}

pub async fn queue_layout_action_for_tab(
    tx: &mut StoreTx,
    tab_id: &str,
    actions: Vec<LayoutActionData>,
) -> Result<()> {
    let layout_id = layout_id_for_tab(tx, tab_id).await?;
    if layout_id.is_empty() {
        bail!("tab {tab_id:?} has no layout state");
    }
    queue_layout_action(tx, &layout_id, actions).await
}

/// Create the blocks of a portable layout and queue the matching
/// insert-at-index actions, preceded by a tree clear.
pub async fn apply_portable_layout(
    tx: &mut StoreTx,
    tab_id: &str,
    layout: Vec<PortableLayoutEntry>,
) -> Result<()> {
    debug!("applying portable layout to tab {tab_id} ({} entries)", layout.len());
    let mut actions = vec![LayoutActionData {
        action_type: ACTION_CLEAR_TREE.to_string(),
        ..Default::default()
    }];
    for entry in layout {
        let block = super::create_block(
            tx,
            tab_id,
            &entry.block_def,
            Some(RuntimeOpts::default()),
        )
        .await
        .with_context(|| format!("unable to create block for layout in tab {tab_id}"))?;
        actions.push(LayoutActionData {
            action_type: ACTION_INSERT_AT_INDEX.to_string(),
            block_id: block.oid,
            index_arr: Some(entry.index_arr),
            node_size: entry.size,
            focused: entry.focused,
            ..Default::default()
        });
    }
    queue_layout_action_for_tab(tx, tab_id, actions)
        .await
        .context("unable to queue layout actions for portable layout")
}

/// Seed the starter layout into the first window's active tab.
pub async fn bootstrap_starter_layout(tx: &mut StoreTx) -> Result<()> {
    let client = tx.get_client().await.context("unable to find client")?;
    let Some(window_id) = client.window_ids.first() else {
        bail!("error bootstrapping layout, no windows exist");
    };
    let window = tx.get_window(window_id).await?;
    let workspace = tx.get_workspace(&window.workspace_id).await?;
    let tab_id = workspace.active_tab_id.clone();
    if tab_id.is_empty() {
        bail!("workspace {} has no active tab", workspace.oid);
    }
    apply_portable_layout(tx, &tab_id, starter_layout())
        .await
        .context("error applying starter layout")
}
