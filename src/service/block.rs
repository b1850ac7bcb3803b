//! Block-controller adjacent operations.

use std::sync::Arc;

use anyhow::bail;

use super::{MethodDesc, MethodResult, ServiceDesc, WebCall, convert};
use crate::App;
use crate::obj::TermSize;

pub const DESC: ServiceDesc = ServiceDesc {
    name: "block",
    methods: &[
        MethodDesc {
            name: "GetControllerStatus",
            arg_names: &["blockId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "SaveTerminalState",
            arg_names: &["blockId", "state", "stateType", "ptyOffset", "termSize"],
            needs_ui_context: false,
        },
    ],
};

pub async fn get_controller_status(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let block_id = convert::arg_str(&call.args, 0, "blockId")?;
    let status = app.controllers.runtime_status(&block_id);
    Ok((status, Vec::new()))
}

/// Persist a terminal state snapshot into the block's cache file.
pub async fn save_terminal_state(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let block_id = convert::arg_str(&call.args, 0, "blockId")?;
    let state = convert::arg_str(&call.args, 1, "state")?;
    let state_type = convert::arg_str(&call.args, 2, "stateType")?;
    let pty_offset = convert::arg_i64(&call.args, 3, "ptyOffset")?;
    let term_size: Option<TermSize> = convert::arg_struct_opt(&call.args, 4, "termSize")?;

    if state_type != "full" && state_type != "preview" {
        bail!("invalid state type: {state_type:?}");
    }
    {
        let mut tx = app.store.begin().await?;
        tx.get_block(&block_id).await?;
        tx.commit().await?;
    }
    let file_name = format!("cache:term:{state_type}");
    let blob = app.store.blob();
    let mut meta = crate::obj::MetaMap::new();
    meta.insert("ptyoffset".to_string(), serde_json::json!(pty_offset));
    if let Some(term_size) = term_size {
        meta.insert("termsize".to_string(), serde_json::to_value(term_size)?);
    }
    blob.make_file(&block_id, &file_name, Some(meta)).await?;
    blob.write_file(&block_id, &file_name, state.as_bytes())
        .await?;
    Ok((None, Vec::new()))
}
