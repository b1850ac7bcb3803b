//! Service dispatch: the single typed entry point used by the UI websocket
//! (and tests) to invoke daemon operations.
//!
//! Services and their methods are declared explicitly in descriptor tables,
//! validated once at startup. Mutating methods capture the store updates of
//! their transaction; the updates ride back in the response envelope and
//! are broadcast through the broker.

mod block;
mod client;
mod convert;
mod object;
mod window;
mod workspace;

pub use convert::*;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::App;
use crate::obj::{UIContext, UpdateRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct WebCall {
    pub service: String,
    pub method: String,
    #[serde(rename = "uicontext", default)]
    pub ui_context: Option<UIContext>,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WebReturn {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<UpdateRecord>,
}

impl WebReturn {
    fn ok(data: Option<Value>, updates: Vec<UpdateRecord>) -> Self {
        Self {
            success: true,
            data,
            updates,
            ..Default::default()
        }
    }

    fn err(error: impl std::fmt::Display) -> Self {
        Self {
            error: error.to_string(),
            ..Default::default()
        }
    }
}

/// What every service method hands back: optional payload plus captured
/// updates.
pub type MethodResult = Result<(Option<Value>, Vec<UpdateRecord>)>;

#[derive(Debug, Clone, Copy)]
pub struct MethodDesc {
    pub name: &'static str,
    pub arg_names: &'static [&'static str],
    /// The method consumes the call's UIContext.
    pub needs_ui_context: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceDesc {
    pub name: &'static str,
    pub methods: &'static [MethodDesc],
}

pub const SERVICES: &[ServiceDesc] = &[
    object::DESC,
    client::DESC,
    window::DESC,
    workspace::DESC,
    block::DESC,
];

/// Startup validation pass over the descriptor tables: names must be unique
/// and non-empty. Refuses the whole map on the first offender.
pub fn validate_service_map() -> Result<()> {
    let mut service_names = HashSet::new();
    for service in SERVICES {
        if service.name.is_empty() {
            bail!("service with empty name");
        }
        if !service_names.insert(service.name) {
            bail!("duplicate service name: {:?}", service.name);
        }
        let mut method_names = HashSet::new();
        for method in service.methods {
            if method.name.is_empty() {
                bail!("service {:?} has a method with an empty name", service.name);
            }
            if !method_names.insert(method.name) {
                bail!(
                    "duplicate method {:?} on service {:?}",
                    method.name,
                    service.name
                );
            }
        }
    }
    Ok(())
}

fn find_method(service: &str, method: &str) -> Option<(&'static ServiceDesc, &'static MethodDesc)> {
    let svc = SERVICES.iter().find(|s| s.name == service)?;
    let m = svc.methods.iter().find(|m| m.name == method)?;
    Some((svc, m))
}

/// Dispatch one call. Argument and arity errors reject the call before any
/// mutation; captured updates are broadcast on success.
pub async fn call_service(app: &Arc<App>, call: WebCall) -> WebReturn {
    let Some((_svc, desc)) = find_method(&call.service, &call.method) else {
        return WebReturn::err(format!(
            "invalid method: {}.{}",
            call.service, call.method
        ));
    };
    if call.args.len() > desc.arg_names.len() {
        return WebReturn::err(format!(
            "too many arguments for {}.{}: got {}, expected {}",
            call.service,
            call.method,
            call.args.len(),
            desc.arg_names.len()
        ));
    }
    if desc.needs_ui_context && call.ui_context.is_none() {
        return WebReturn::err(format!(
            "missing UIContext for {}.{}",
            call.service, call.method
        ));
    }
    debug!("service call {}.{}", call.service, call.method);
    let result = route_call(app, &call).await;
    match result {
        Ok((data, updates)) => {
            if !updates.is_empty() {
                app.broker.send_update_events(&updates);
            }
            WebReturn::ok(data, updates)
        }
        Err(e) => WebReturn::err(format!("{e:#}")),
    }
}

async fn route_call(app: &Arc<App>, call: &WebCall) -> MethodResult {
    match (call.service.as_str(), call.method.as_str()) {
        ("object", "GetObject") => object::get_object(app, call).await,
        ("object", "GetObjects") => object::get_objects(app, call).await,
        ("object", "UpdateTabName") => object::update_tab_name(app, call).await,
        ("object", "CreateBlock") => object::create_block(app, call).await,
        ("object", "DeleteBlock") => object::delete_block(app, call).await,
        ("object", "UpdateObjectMeta") => object::update_object_meta(app, call).await,
        ("object", "UpdateObject") => object::update_object(app, call).await,

        ("client", "GetClientData") => client::get_client_data(app, call).await,
        ("client", "GetTab") => client::get_tab(app, call).await,
        ("client", "GetAllConnStatus") => client::get_all_conn_status(app, call).await,
        ("client", "FocusWindow") => client::focus_window(app, call).await,
        ("client", "AgreeTos") => client::agree_tos(app, call).await,

        ("window", "GetWindow") => window::get_window(app, call).await,
        ("window", "CreateWindow") => window::create_window(app, call).await,
        ("window", "SetWindowPosAndSize") => window::set_window_pos_and_size(app, call).await,
        ("window", "MoveBlockToNewWindow") => window::move_block_to_new_window(app, call).await,
        ("window", "SwitchWorkspace") => window::switch_workspace(app, call).await,
        ("window", "CloseWindow") => window::close_window(app, call).await,

        ("workspace", "CreateWorkspace") => workspace::create_workspace(app, call).await,
        ("workspace", "UpdateWorkspace") => workspace::update_workspace(app, call).await,
        ("workspace", "GetWorkspace") => workspace::get_workspace(app, call).await,
        ("workspace", "DeleteWorkspace") => workspace::delete_workspace(app, call).await,
        ("workspace", "ListWorkspaces") => workspace::list_workspaces(app, call).await,
        ("workspace", "CreateTab") => workspace::create_tab(app, call).await,
        ("workspace", "ChangeTabPinning") => workspace::change_tab_pinning(app, call).await,
        ("workspace", "UpdateTabIds") => workspace::update_tab_ids(app, call).await,
        ("workspace", "SetActiveTab") => workspace::set_active_tab(app, call).await,
        ("workspace", "CloseTab") => workspace::close_tab(app, call).await,
        ("workspace", "GetColors") => workspace::get_colors(app, call).await,
        ("workspace", "GetIcons") => workspace::get_icons(app, call).await,

        ("block", "GetControllerStatus") => block::get_controller_status(app, call).await,
        ("block", "SaveTerminalState") => block::save_terminal_state(app, call).await,

        (service, method) => bail!("invalid method: {service}.{method}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_service_map() {
        validate_service_map().unwrap();
    }

    #[test]
    fn test_find_method() {
        assert!(find_method("object", "GetObject").is_some());
        assert!(find_method("object", "NoSuch").is_none());
        assert!(find_method("nosuch", "GetObject").is_none());
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = crate::base::Paths::new(tmp.path().join("data"), tmp.path().join("config"));
        let app = crate::App::init_in_memory(paths).await.unwrap();
        let rtn = call_service(
            &app,
            WebCall {
                service: "bogus".into(),
                method: "Nope".into(),
                ui_context: None,
                args: vec![],
            },
        )
        .await;
        assert!(!rtn.success);
        assert!(rtn.error.contains("invalid method"));
    }
}
