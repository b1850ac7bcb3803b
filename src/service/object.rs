//! Generic object operations: fetch by oref, metadata merges, raw updates,
//! and block create/delete against the caller's active tab.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use serde_json::json;

use super::{MethodDesc, MethodResult, ServiceDesc, WebCall, convert};
use crate::App;
use crate::core;
use crate::obj::{BlockDef, ORef, OTYPE_WORKSPACE, RuntimeOpts, StarObj};
use crate::pubsub::{EVENT_WORKSPACE_UPDATE, StarEvent};

pub const DESC: ServiceDesc = ServiceDesc {
    name: "object",
    methods: &[
        MethodDesc {
            name: "GetObject",
            arg_names: &["oref"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetObjects",
            arg_names: &["orefs"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "UpdateTabName",
            arg_names: &["tabId", "name"],
            needs_ui_context: true,
        },
        MethodDesc {
            name: "CreateBlock",
            arg_names: &["blockDef", "rtOpts"],
            needs_ui_context: true,
        },
        MethodDesc {
            name: "DeleteBlock",
            arg_names: &["blockId"],
            needs_ui_context: true,
        },
        MethodDesc {
            name: "UpdateObjectMeta",
            arg_names: &["oref", "meta"],
            needs_ui_context: true,
        },
        MethodDesc {
            name: "UpdateObject",
            arg_names: &["starObj", "returnUpdates"],
            needs_ui_context: true,
        },
    ],
};

pub async fn get_object(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let oref = convert::arg_oref(&call.args, 0, "oref")?;
    let mut tx = app.store.begin().await?;
    let obj = tx.get(&oref).await.context("error getting object")?;
    tx.commit().await?;
    Ok((obj.map(|o| serde_json::to_value(o)).transpose()?, Vec::new()))
}

pub async fn get_objects(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let oref_strs = convert::arg_str_vec(&call.args, 0, "orefs")?;
    let mut orefs = Vec::with_capacity(oref_strs.len());
    for s in &oref_strs {
        orefs.push(s.parse::<ORef>().map_err(|e| anyhow!("{e}"))?);
    }
    let mut tx = app.store.begin().await?;
    let objs = tx.select_orefs(&orefs).await?;
    tx.commit().await?;
    Ok((Some(serde_json::to_value(objs)?), Vec::new()))
}

pub async fn update_tab_name(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let tab_id = convert::arg_str(&call.args, 0, "tabId")?;
    let name = convert::arg_str(&call.args, 1, "name")?;
    let mut tx = app.store.begin().await?;
    let mut tab = tx.get_tab(&tab_id).await.context("tab not found")?;
    tab.name = name;
    tx.update_obj(tab).await?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

pub async fn create_block(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let ui = call.ui_context.clone().unwrap_or_default();
    if ui.active_tab_id.is_empty() {
        bail!("no active tab");
    }
    let block_def: BlockDef = convert::arg_struct(&call.args, 0, "blockDef")?;
    let rt_opts: Option<RuntimeOpts> = convert::arg_struct_opt(&call.args, 1, "rtOpts")?;
    let mut tx = app.store.begin().await?;
    let block = core::create_block(&mut tx, &ui.active_tab_id, &block_def, rt_opts).await?;
    let updates = tx.commit().await?;
    Ok((Some(json!(block.oid)), updates))
}

pub async fn delete_block(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let block_id = convert::arg_str(&call.args, 0, "blockId")?;
    let mut tx = app.store.begin().await?;
    core::delete_block(
        &mut tx,
        &app.broker,
        app.controllers.as_ref(),
        &block_id,
        true,
    )
    .await
    .context("error deleting block")?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

pub async fn update_object_meta(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let oref = convert::arg_oref(&call.args, 0, "oref")?;
    let meta = convert::arg_meta(&call.args, 1, "meta")?;
    let mut tx = app.store.begin().await?;
    tx.update_object_meta(&oref, &meta, false)
        .await
        .with_context(|| format!("error updating {oref} meta"))?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

pub async fn update_object(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let mut obj = convert::arg_star_obj(&call.args, 0, "starObj")?;
    let return_updates = convert::arg_bool(&call.args, 1, "returnUpdates")?;
    let oref = obj.oref();
    let mut tx = app.store.begin().await?;
    if !tx.exists(&oref).await? {
        bail!("object not found: {oref}");
    }
    tx.update(&mut obj).await.context("error updating object")?;
    let updates = tx.commit().await?;
    if obj.otype() == OTYPE_WORKSPACE {
        if let StarObj::Workspace(ws) = &obj {
            if !ws.name.is_empty() {
                app.broker.publish(StarEvent {
                    event: EVENT_WORKSPACE_UPDATE.to_string(),
                    ..Default::default()
                });
            }
        }
    }
    if return_updates {
        Ok((None, updates))
    } else {
        // broadcast still happens; the caller just opted out of the list
        app.broker.send_update_events(&updates);
        Ok((None, Vec::new()))
    }
}
