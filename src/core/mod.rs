//! Core application coordinator: operations across the object store, the
//! pub/sub broker, and the layout queue. Service dispatch and the RPC server
//! both route their mutations through this module.

mod block;
mod client;
mod layout;
mod window;
mod workspace;

pub use block::{
    DeleteBlockResult, create_block, create_sub_block, delete_block, ensure_not_descendant,
};
pub use client::{create_client, ensure_initial_data, focus_window, get_client_data};
pub use layout::{
    ACTION_CLEAR_TREE, ACTION_INSERT, ACTION_INSERT_AT_INDEX, ACTION_REMOVE, ACTION_REPLACE,
    ACTION_SPLIT_HORIZONTAL, ACTION_SPLIT_VERTICAL, PortableLayoutEntry, apply_portable_layout,
    bootstrap_starter_layout, new_tab_layout, queue_layout_action, queue_layout_action_for_tab,
    starter_layout,
};
pub use window::{close_window, create_window, switch_workspace};
pub use workspace::{
    WorkspaceListEntry, change_tab_pinning, create_tab, create_workspace, delete_tab,
    delete_workspace, list_workspaces, send_active_tab_update, set_active_tab, update_workspace,
    update_workspace_tab_ids,
};

use serde_json::Value;

pub const WORKSPACE_COLORS: &[&str] = &[
    "#58C142", "#00FFDB", "#429DFF", "#BF55EC", "#FF453A", "#FF9E45", "#FFE145", "#8BC34A",
];

pub const WORKSPACE_ICONS: &[&str] = &[
    "custom@star-logo-solid",
    "triangle",
    "star",
    "heart",
    "bolt",
    "cloud",
    "moon",
    "layer-group",
];

/// External block-controller engine, specified by interface only. The daemon
/// asks it to stop or resync the process behind a block; the default host
/// does nothing.
pub trait BlockControllerHost: Send + Sync {
    fn stop_controller(&self, block_id: &str);

    fn resync_controller(&self, tab_id: &str, block_id: &str, force_restart: bool);

    fn runtime_status(&self, block_id: &str) -> Option<Value> {
        let _ = block_id;
        None
    }
}

pub struct NoopControllerHost;

impl BlockControllerHost for NoopControllerHost {
    fn stop_controller(&self, _block_id: &str) {}

    fn resync_controller(&self, _tab_id: &str, _block_id: &str, _force_restart: bool) {}
}
