//! Client-level operations.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use super::{MethodDesc, MethodResult, ServiceDesc, WebCall, convert};
use crate::App;
use crate::core;
use crate::obj::StarObj;

pub const DESC: ServiceDesc = ServiceDesc {
    name: "client",
    methods: &[
        MethodDesc {
            name: "GetClientData",
            arg_names: &[],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetTab",
            arg_names: &["tabId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "GetAllConnStatus",
            arg_names: &[],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "FocusWindow",
            arg_names: &["windowId"],
            needs_ui_context: false,
        },
        MethodDesc {
            name: "AgreeTos",
            arg_names: &[],
            needs_ui_context: false,
        },
    ],
};

pub async fn get_client_data(app: &Arc<App>, _call: &WebCall) -> MethodResult {
    let mut tx = app.store.begin().await?;
    let client = core::get_client_data(&mut tx).await?;
    tx.commit().await?;
    Ok((
        Some(serde_json::to_value(StarObj::from(client))?),
        Vec::new(),
    ))
}

pub async fn get_tab(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let tab_id = convert::arg_str(&call.args, 0, "tabId")?;
    let mut tx = app.store.begin().await?;
    let tab = tx.get_tab(&tab_id).await.context("error getting tab")?;
    tx.commit().await?;
    Ok((Some(serde_json::to_value(StarObj::from(tab))?), Vec::new()))
}

pub async fn get_all_conn_status(app: &Arc<App>, _call: &WebCall) -> MethodResult {
    let statuses = app.conns.all_statuses().await;
    Ok((Some(serde_json::to_value(statuses)?), Vec::new()))
}

pub async fn focus_window(app: &Arc<App>, call: &WebCall) -> MethodResult {
    let window_id = convert::arg_str(&call.args, 0, "windowId")?;
    let mut tx = app.store.begin().await?;
    core::focus_window(&mut tx, &window_id).await?;
    let updates = tx.commit().await?;
    Ok((None, updates))
}

/// Stamp the tos-agreed timestamp and seed the starter layout into the
/// first window's tab.
pub async fn agree_tos(app: &Arc<App>, _call: &WebCall) -> MethodResult {
    let mut tx = app.store.begin().await?;
    let mut client = tx.get_client().await.context("error getting client data")?;
    client.tos_agreed = chrono::Utc::now().timestamp_millis();
    tx.update_obj(client).await.context("error updating client data")?;
    core::bootstrap_starter_layout(&mut tx).await?;
    let updates = tx.commit().await?;
    Ok((Some(json!(true)), updates))
}
