//! The local default service: command handlers behind the router's default
//! route. Mirrors the wsh agent surface — object metadata, block lifecycle,
//! events, connections, config, and diagnostics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use super::frame::RpcMessage;
use super::router::PEER_CHANNEL_SIZE;
use crate::App;
use crate::conn::RemoteInfo;
use crate::core;
use crate::obj::{
    BlockDef, MetaMap, ORef, OTYPE_BLOCK, RuntimeOpts, StarObj, META_KEY_FILE, META_KEY_VIEW,
};
use crate::pubsub::{StarEvent, SubscriptionRequest};
use crate::telemetry::{ActivityUpdate, TEvent, TEventProps};

const STREAM_TEST_COUNT: i64 = 5;
const STREAM_TEST_DELAY: Duration = Duration::from_millis(100);

enum Handled {
    Done(Option<Value>),
    /// The handler owns its own response frames (streams).
    Streamed,
}

pub struct RpcServer {
    app: Arc<App>,
    cancels: Arc<DashMap<String, Arc<Notify>>>,
}

impl RpcServer {
    /// Spawn the dispatcher loop and bind it as the router's default
    /// handler.
    pub fn start(app: Arc<App>) -> Arc<Self> {
        let server = Arc::new(Self {
            app: app.clone(),
            cancels: Arc::new(DashMap::new()),
        });
        let (tx, mut rx) = mpsc::channel::<RpcMessage>(PEER_CHANNEL_SIZE);
        app.router.set_default_handler(tx);
        let this = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.cancel {
                    // notify_one stores a permit, so a cancel that lands
                    // between chunks is not lost
                    if let Some(notify) = this.cancels.get(&msg.reqid) {
                        notify.notify_one();
                    }
                    continue;
                }
                let handler = this.clone();
                tokio::spawn(async move {
                    handler.handle(msg).await;
                });
            }
        });
        server
    }

    async fn handle(self: Arc<Self>, msg: RpcMessage) {
        let command = msg.command.clone();
        let result = self.dispatch(&msg).await;
        match result {
            Ok(Handled::Streamed) => {}
            Ok(Handled::Done(data)) => {
                if !msg.reqid.is_empty() {
                    self.app.router.deliver(msg.response(data));
                }
            }
            Err(e) => {
                debug!("command {command:?} failed: {e:#}");
                if !msg.reqid.is_empty() {
                    self.app.router.deliver(msg.error_response(format!("{e:#}")));
                }
            }
        }
    }

    async fn dispatch(&self, msg: &RpcMessage) -> Result<Handled> {
        match msg.command.as_str() {
            "message" => self.handle_message(msg),
            "getmeta" => self.handle_get_meta(msg).await,
            "setmeta" => self.handle_set_meta(msg).await,
            "setview" => self.handle_set_view(msg).await,
            "resolveids" => self.handle_resolve_ids(msg).await,
            "createblock" => self.handle_create_block(msg).await,
            "createsubblock" => self.handle_create_sub_block(msg).await,
            "deleteblock" => self.handle_delete_block(msg, true).await,
            "deletesubblock" => self.handle_delete_block(msg, false).await,
            "controllerstop" => self.handle_controller_stop(msg),
            "controllerresync" => self.handle_controller_resync(msg),
            "controllerinput" => self.handle_controller_input(msg),
            "eventrecv" => Ok(Handled::Done(None)),
            "authenticatetoken" => self.handle_authenticate_token(msg),
            "announce" => self.handle_announce(msg),
            "dispose" => self.handle_dispose(msg),
            "eventpublish" => self.handle_event_publish(msg),
            "eventsub" => self.handle_event_sub(msg),
            "eventunsub" => self.handle_event_unsub(msg),
            "eventunsuball" => self.handle_event_unsub_all(msg),
            "eventreadhistory" => self.handle_event_read_history(msg),
            "streamtest" => self.handle_stream_test(msg),
            "waitforroute" => self.handle_wait_for_route(msg).await,
            "connstatus" => Ok(Handled::Done(Some(serde_json::to_value(
                self.app.conns.ssh_statuses().await,
            )?))),
            "wslstatus" => Ok(Handled::Done(Some(serde_json::to_value(
                self.app.conns.wsl_statuses().await,
            )?))),
            "connensure" => self.handle_conn_ensure(msg).await,
            "connconnect" => self.handle_conn_connect(msg).await,
            "conndisconnect" => self.handle_conn_disconnect(msg).await,
            "connreinstallwsh" => self.handle_conn_reinstall(msg).await,
            "connupdatewsh" => self.handle_conn_update_wsh(msg).await,
            "connlist" => self.handle_conn_list(),
            "wsllist" => self.handle_wsl_list().await,
            "wsldefaultdistro" => self.handle_wsl_default_distro().await,
            "dismisswshfail" => self.handle_dismiss_wsh_fail(msg),
            "blockinfo" => self.handle_block_info(msg).await,
            "starinfo" => self.handle_star_info().await,
            "workspacelist" => self.handle_workspace_list().await,
            "getfullconfig" => Ok(Handled::Done(Some(serde_json::to_value(
                self.app.config.full_config(),
            )?))),
            "setconfig" => self.handle_set_config(msg),
            "setconnectionsconfig" => self.handle_set_connections_config(msg),
            "getvar" => self.handle_get_var(msg).await,
            "setvar" => self.handle_set_var(msg).await,
            "gettab" => self.handle_get_tab(msg).await,
            "wshactivity" => self.handle_wsh_activity(msg),
            "activity" => self.handle_activity(msg),
            "path" => self.handle_path(msg).await,
            other => bail!("unknown command: {other:?}"),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, msg: &RpcMessage) -> Result<T> {
        let data = msg.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data)
            .with_context(|| format!("bad arguments for {:?}", msg.command))
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    fn handle_message(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct MessageData {
            #[serde(default)]
            oref: String,
            #[serde(default)]
            message: String,
        }
        let data: MessageData = self.decode(msg)?;
        info!("MESSAGE: {} | {:?} (src {:?})", data.oref, data.message, msg.source);
        Ok(Handled::Done(None))
    }

    fn handle_stream_test(&self, msg: &RpcMessage) -> Result<Handled> {
        let notify = Arc::new(Notify::new());
        self.cancels.insert(msg.reqid.clone(), notify.clone());
        let router = self.app.router.clone();
        let request = msg.clone();
        let cancels_key = msg.reqid.clone();
        let cancels = self.cancels.clone();
        tokio::spawn(async move {
            let mut canceled = false;
            for i in 1..=STREAM_TEST_COUNT {
                tokio::select! {
                    _ = tokio::time::sleep(STREAM_TEST_DELAY) => {
                        router.deliver(request.chunk_response(Some(json!(i))));
                    }
                    _ = notify.notified() => {
                        canceled = true;
                        break;
                    }
                }
            }
            if canceled {
                router.deliver(request.error_response("canceled"));
            } else {
                router.deliver(request.response(None));
            }
            cancels.remove(&cancels_key);
        });
        Ok(Handled::Streamed)
    }

    // ------------------------------------------------------------------
    // object metadata
    // ------------------------------------------------------------------

    async fn handle_get_meta(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct GetMetaData {
            oref: ORef,
        }
        let data: GetMetaData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let obj = tx
            .get(&data.oref)
            .await?
            .ok_or_else(|| anyhow!("object not found: {}", data.oref))?;
        tx.commit().await?;
        Ok(Handled::Done(Some(serde_json::to_value(obj.meta())?)))
    }

    async fn handle_set_meta(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct SetMetaData {
            oref: ORef,
            #[serde(default)]
            meta: MetaMap,
        }
        let data: SetMetaData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        tx.update_object_meta(&data.oref, &data.meta, false).await?;
        let updates = tx.commit().await?;
        self.app.broker.send_update_events(&updates);
        Ok(Handled::Done(None))
    }

    async fn handle_set_view(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct SetViewData {
            #[serde(rename = "blockid")]
            block_id: String,
            view: String,
        }
        let data: SetViewData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let mut block = tx.get_block(&data.block_id).await?;
        block.meta.insert(META_KEY_VIEW.to_string(), json!(data.view));
        tx.update_obj(block).await?;
        let updates = tx.commit().await?;
        self.app.broker.send_update_events(&updates);
        Ok(Handled::Done(None))
    }

    async fn handle_resolve_ids(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ResolveIdsData {
            #[serde(default)]
            ids: Vec<String>,
        }
        let data: ResolveIdsData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut first_err = None;
        for id in &data.ids {
            match tx.resolve_easy_oid(id).await {
                Ok(oref) => {
                    resolved.insert(id.clone(), oref.to_string());
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        tx.commit().await?;
        if let (Some(e), 1) = (&first_err, data.ids.len()) {
            bail!("{e}");
        }
        Ok(Handled::Done(Some(json!({ "resolvedids": resolved }))))
    }

    // ------------------------------------------------------------------
    // block lifecycle
    // ------------------------------------------------------------------

    async fn handle_create_block(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct CreateBlockData {
            #[serde(rename = "tabid")]
            tab_id: String,
            #[serde(rename = "blockdef")]
            block_def: BlockDef,
            #[serde(rename = "rtopts", default)]
            rt_opts: Option<RuntimeOpts>,
            #[serde(default)]
            magnified: bool,
            #[serde(default)]
            ephemeral: bool,
            #[serde(rename = "targetblockid", default)]
            target_block_id: String,
            #[serde(rename = "targetaction", default)]
            target_action: String,
        }
        let data: CreateBlockData = self.decode(msg)?;

        let mut tx = self.app.store.begin().await?;
        let block = core::create_block(&mut tx, &data.tab_id, &data.block_def, data.rt_opts).await?;
        let layout_action = if !data.target_block_id.is_empty() {
            match data.target_action.as_str() {
                "replace" => {
                    core::delete_block(
                        &mut tx,
                        &self.app.broker,
                        self.app.controllers.as_ref(),
                        &data.target_block_id,
                        false,
                    )
                    .await
                    .context("error deleting block for replace")?;
                    crate::obj::LayoutActionData {
                        action_type: core::ACTION_REPLACE.to_string(),
                        target_block_id: data.target_block_id.clone(),
                        block_id: block.oid.clone(),
                        focused: true,
                        ..Default::default()
                    }
                }
                "splitright" | "splitleft" | "splitup" | "splitdown" => {
                    let (action_type, position) = match data.target_action.as_str() {
                        "splitright" => (core::ACTION_SPLIT_HORIZONTAL, "after"),
                        "splitleft" => (core::ACTION_SPLIT_HORIZONTAL, "before"),
                        "splitup" => (core::ACTION_SPLIT_VERTICAL, "before"),
                        _ => (core::ACTION_SPLIT_VERTICAL, "after"),
                    };
                    crate::obj::LayoutActionData {
                        action_type: action_type.to_string(),
                        block_id: block.oid.clone(),
                        target_block_id: data.target_block_id.clone(),
                        position: position.to_string(),
                        ..Default::default()
                    }
                }
                other => bail!("invalid target action: {other:?}"),
            }
        } else {
            crate::obj::LayoutActionData {
                action_type: core::ACTION_INSERT.to_string(),
                block_id: block.oid.clone(),
                magnified: data.magnified,
                ephemeral: data.ephemeral,
                focused: true,
                ..Default::default()
            }
        };
        core::queue_layout_action_for_tab(&mut tx, &data.tab_id, vec![layout_action])
            .await
            .context("error queuing layout action")?;
        let updates = tx.commit().await?;

        // initial blob files are written outside the transaction; a failure
        // rolls the block back
        if let Err(e) = self.write_block_files(&block.oid, &data.block_def).await {
            self.cleanup_failed_block(&block.oid).await;
            return Err(e);
        }

        self.app.broker.send_update_events(&updates);
        self.record_block_telemetry(&data.block_def);
        Ok(Handled::Done(Some(json!(
            ORef::new(OTYPE_BLOCK, block.oid).to_string()
        ))))
    }

    async fn write_block_files(&self, block_id: &str, block_def: &BlockDef) -> Result<()> {
        let blob = self.app.store.blob();
        for (file_name, file_def) in &block_def.files {
            blob.make_file(block_id, file_name, Some(file_def.meta.clone()))
                .await
                .with_context(|| format!("error making blockfile {file_name:?}"))?;
            blob.write_file(block_id, file_name, file_def.content.as_bytes())
                .await
                .with_context(|| format!("error writing blockfile {file_name:?}"))?;
        }
        Ok(())
    }

    async fn cleanup_failed_block(&self, block_id: &str) {
        let result = async {
            let mut tx = self.app.store.begin().await?;
            core::delete_block(
                &mut tx,
                &self.app.broker,
                self.app.controllers.as_ref(),
                block_id,
                false,
            )
            .await?;
            tx.commit().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!("error cleaning up failed block {block_id}: {e:#}");
        }
    }

    fn record_block_telemetry(&self, block_def: &BlockDef) {
        let view = block_def.meta.get_string(META_KEY_VIEW, "");
        if view.is_empty() {
            return;
        }
        self.app.telemetry.update_activity(ActivityUpdate {
            renderers: HashMap::from([(view.clone(), 1)]),
            ..Default::default()
        });
        self.app.telemetry.record_tevent(TEvent {
            event: "action:createblock".to_string(),
            props: TEventProps {
                block_view: view,
                ..Default::default()
            },
        });
    }

    async fn handle_create_sub_block(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct CreateSubBlockData {
            #[serde(rename = "parentblockid")]
            parent_block_id: String,
            #[serde(rename = "blockdef")]
            block_def: BlockDef,
        }
        let data: CreateSubBlockData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let block = core::create_sub_block(&mut tx, &data.parent_block_id, &data.block_def).await?;
        let updates = tx.commit().await?;
        self.app.broker.send_update_events(&updates);
        Ok(Handled::Done(Some(json!(
            ORef::new(OTYPE_BLOCK, block.oid).to_string()
        ))))
    }

    async fn handle_delete_block(&self, msg: &RpcMessage, recursive: bool) -> Result<Handled> {
        #[derive(Deserialize)]
        struct DeleteBlockData {
            #[serde(rename = "blockid")]
            block_id: String,
        }
        let data: DeleteBlockData = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let tab_id = if recursive {
            let tab_id = tx
                .find_tab_for_block(&data.block_id)
                .await
                .context("error finding tab for block")?;
            Some(tab_id)
        } else {
            None
        };
        let result = core::delete_block(
            &mut tx,
            &self.app.broker,
            self.app.controllers.as_ref(),
            &data.block_id,
            recursive,
        )
        .await
        .context("error deleting block")?;
        if let Some(tab_id) = tab_id {
            if result.deleted_tab_id.as_deref() != Some(tab_id.as_str()) {
                core::queue_layout_action_for_tab(
                    &mut tx,
                    &tab_id,
                    vec![crate::obj::LayoutActionData {
                        action_type: core::ACTION_REMOVE.to_string(),
                        block_id: data.block_id.clone(),
                        ..Default::default()
                    }],
                )
                .await?;
            }
        }
        let updates = tx.commit().await?;
        self.app.broker.send_update_events(&updates);
        Ok(Handled::Done(None))
    }

    // ------------------------------------------------------------------
    // block controllers (external engine)
    // ------------------------------------------------------------------

    fn handle_controller_stop(&self, msg: &RpcMessage) -> Result<Handled> {
        let block_id: String = self.decode(msg)?;
        self.app.controllers.stop_controller(&block_id);
        Ok(Handled::Done(None))
    }

    fn handle_controller_resync(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ResyncData {
            #[serde(rename = "tabid", default)]
            tab_id: String,
            #[serde(rename = "blockid")]
            block_id: String,
            #[serde(rename = "forcerestart", default)]
            force_restart: bool,
        }
        let data: ResyncData = self.decode(msg)?;
        self.app
            .controllers
            .resync_controller(&data.tab_id, &data.block_id, data.force_restart);
        Ok(Handled::Done(None))
    }

    fn handle_controller_input(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct InputData {
            #[serde(rename = "blockid")]
            block_id: String,
            #[serde(rename = "inputdata64", default)]
            input_data64: String,
        }
        let data: InputData = self.decode(msg)?;
        let _input = BASE64
            .decode(data.input_data64.as_bytes())
            .context("error decoding input data")?;
        // the PTY engine is an external collaborator; without one attached
        // there is nothing to feed
        bail!("block controller not found for block {:?}", data.block_id)
    }

    // ------------------------------------------------------------------
    // router housekeeping
    // ------------------------------------------------------------------

    /// Redeem a one-shot shell swap token for its environment and init
    /// script.
    fn handle_authenticate_token(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct TokenData {
            token: String,
        }
        let data: TokenData = self.decode(msg)?;
        let entry = self.app.router.swap_tokens.take(&data.token)?;
        Ok(Handled::Done(Some(json!({
            "env": entry.env,
            "initscripttext": entry.script_text,
        }))))
    }

    /// A proxy peer announces a route it forwards for; bind it to the
    /// peer's transport.
    fn handle_announce(&self, msg: &RpcMessage) -> Result<Handled> {
        let source = self.require_source(msg)?;
        let route_id: String = self.decode(msg)?;
        if route_id.is_empty() {
            bail!("announce requires a route id");
        }
        if !self.app.router.alias_route(&route_id, &source) {
            bail!("unknown announcing route: {source:?}");
        }
        Ok(Handled::Done(None))
    }

    fn handle_dispose(&self, msg: &RpcMessage) -> Result<Handled> {
        self.require_source(msg)?;
        let route_id: String = self.decode(msg)?;
        if route_id.is_empty() {
            bail!("dispose requires a route id");
        }
        self.app.router.dispose_route(&route_id);
        Ok(Handled::Done(None))
    }

    // ------------------------------------------------------------------
    // events
    // ------------------------------------------------------------------

    fn require_source(&self, msg: &RpcMessage) -> Result<String> {
        if msg.source.is_empty() {
            bail!("no rpc source set");
        }
        Ok(msg.source.clone())
    }

    fn handle_event_publish(&self, msg: &RpcMessage) -> Result<Handled> {
        let source = self.require_source(msg)?;
        let mut event: StarEvent = self.decode(msg)?;
        if event.sender.is_empty() {
            event.sender = source;
        }
        self.app.broker.publish(event);
        Ok(Handled::Done(None))
    }

    fn handle_event_sub(&self, msg: &RpcMessage) -> Result<Handled> {
        let source = self.require_source(msg)?;
        let sub: SubscriptionRequest = self.decode(msg)?;
        self.app.broker.subscribe(&source, sub);
        Ok(Handled::Done(None))
    }

    fn handle_event_unsub(&self, msg: &RpcMessage) -> Result<Handled> {
        let source = self.require_source(msg)?;
        let event: String = self.decode(msg)?;
        self.app.broker.unsubscribe(&source, &event);
        Ok(Handled::Done(None))
    }

    fn handle_event_unsub_all(&self, msg: &RpcMessage) -> Result<Handled> {
        let source = self.require_source(msg)?;
        self.app.broker.unsubscribe_all(&source);
        Ok(Handled::Done(None))
    }

    fn handle_event_read_history(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ReadHistoryData {
            event: String,
            #[serde(default)]
            scope: String,
            #[serde(rename = "maxitems", default)]
            max_items: usize,
        }
        let data: ReadHistoryData = self.decode(msg)?;
        let events = self
            .app
            .broker
            .read_event_history(&data.event, &data.scope, data.max_items);
        Ok(Handled::Done(Some(serde_json::to_value(events)?)))
    }

    async fn handle_wait_for_route(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct WaitForRouteData {
            #[serde(rename = "routeid")]
            route_id: String,
            #[serde(rename = "waitms", default)]
            wait_ms: u64,
        }
        let data: WaitForRouteData = self.decode(msg)?;
        let ok = self
            .app
            .router
            .wait_for_route(&data.route_id, Duration::from_millis(data.wait_ms))
            .await;
        Ok(Handled::Done(Some(json!(ok))))
    }

    // ------------------------------------------------------------------
    // connections
    // ------------------------------------------------------------------

    async fn handle_conn_ensure(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ConnExtData {
            #[serde(rename = "connname")]
            conn_name: String,
        }
        let data: ConnExtData = self.decode(msg)?;
        self.app.conns.ensure(&data.conn_name, None).await?;
        Ok(Handled::Done(None))
    }

    async fn handle_conn_connect(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ConnRequest {
            host: String,
            #[serde(default)]
            keywords: Option<MetaMap>,
        }
        let data: ConnRequest = self.decode(msg)?;
        self.app.conns.connect(&data.host, data.keywords).await?;
        Ok(Handled::Done(None))
    }

    async fn handle_conn_disconnect(&self, msg: &RpcMessage) -> Result<Handled> {
        let conn_name: String = self.decode(msg)?;
        self.app.conns.disconnect(&conn_name).await?;
        Ok(Handled::Done(None))
    }

    async fn handle_conn_reinstall(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ConnExtData {
            #[serde(rename = "connname")]
            conn_name: String,
        }
        let data: ConnExtData = self.decode(msg)?;
        self.app.conns.reinstall_wsh(&data.conn_name).await?;
        Ok(Handled::Done(None))
    }

    async fn handle_conn_update_wsh(&self, msg: &RpcMessage) -> Result<Handled> {
        let remote_info: RemoteInfo = self.decode(msg)?;
        let Some(conn_name) = msg.source.strip_prefix("conn:") else {
            bail!("invalid remote info: missing connection name");
        };
        debug!(
            "checking wsh version for connection {conn_name} (agent {})",
            remote_info.client_version
        );
        let needs_restart = self.app.conns.update_wsh(conn_name, &remote_info).await?;
        Ok(Handled::Done(Some(json!(needs_restart))))
    }

    fn handle_conn_list(&self) -> Result<Handled> {
        let configured = self.app.config.full_config().connections;
        let list = self.app.conns.connection_list(configured.into_keys());
        Ok(Handled::Done(Some(serde_json::to_value(list)?)))
    }

    async fn handle_wsl_list(&self) -> Result<Handled> {
        let distros = crate::conn::list_distros().await?;
        Ok(Handled::Done(Some(serde_json::to_value(distros)?)))
    }

    async fn handle_wsl_default_distro(&self) -> Result<Handled> {
        let distro = crate::conn::default_distro().await?;
        Ok(Handled::Done(Some(json!(distro))))
    }

    fn handle_dismiss_wsh_fail(&self, msg: &RpcMessage) -> Result<Handled> {
        let conn_name: String = self.decode(msg)?;
        self.app.conns.dismiss_wsh_error(&conn_name)?;
        Ok(Handled::Done(None))
    }

    // ------------------------------------------------------------------
    // info / config / vars
    // ------------------------------------------------------------------

    async fn handle_block_info(&self, msg: &RpcMessage) -> Result<Handled> {
        let block_id: String = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let block = tx.get_block(&block_id).await.context("error getting block")?;
        let tab_id = tx
            .find_tab_for_block(&block_id)
            .await
            .context("error finding tab for block")?;
        let workspace_id = tx
            .find_workspace_for_tab(&tab_id)
            .await
            .context("error finding workspace for tab")?;
        tx.commit().await?;
        let files = self.app.store.blob().list_files(&block_id).await?;
        let file_infos: Vec<Value> = files
            .iter()
            .map(|f| {
                json!({
                    "path": format!("starfile://{}/{}", f.zone_id, f.name),
                    "name": f.name,
                    "size": f.size,
                })
            })
            .collect();
        Ok(Handled::Done(Some(json!({
            "blockid": block_id,
            "tabid": tab_id,
            "workspaceid": workspace_id,
            "block": StarObj::from(block),
            "files": file_infos,
        }))))
    }

    async fn handle_star_info(&self) -> Result<Handled> {
        let mut tx = self.app.store.begin().await?;
        let client = tx.get_client().await?;
        tx.commit().await?;
        Ok(Handled::Done(Some(json!({
            "version": crate::base::STAR_VERSION,
            "clientid": client.oid,
            "configdir": self.app.paths.config_dir,
            "datadir": self.app.paths.data_dir,
        }))))
    }

    async fn handle_workspace_list(&self) -> Result<Handled> {
        let mut tx = self.app.store.begin().await?;
        let list = core::list_workspaces(&mut tx).await?;
        let mut rtn = Vec::new();
        for entry in &list {
            let ws = tx.get_workspace(&entry.workspace_id).await?;
            rtn.push(json!({
                "windowid": entry.window_id,
                "workspacedata": StarObj::from(ws),
            }));
        }
        tx.commit().await?;
        Ok(Handled::Done(Some(Value::Array(rtn))))
    }

    fn handle_set_config(&self, msg: &RpcMessage) -> Result<Handled> {
        let meta: MetaMap = self.decode(msg)?;
        crate::config::set_base_config_value(&self.app.paths, &meta)?;
        self.app.config.reread();
        Ok(Handled::Done(None))
    }

    fn handle_set_connections_config(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct ConnConfigRequest {
            host: String,
            #[serde(rename = "metamaptype", default)]
            meta: MetaMap,
        }
        let data: ConnConfigRequest = self.decode(msg)?;
        crate::config::set_connections_config_value(&self.app.paths, &data.host, &data.meta)?;
        self.app.config.reread();
        Ok(Handled::Done(None))
    }

    async fn handle_get_var(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct VarData {
            #[serde(rename = "zoneid")]
            zone_id: String,
            #[serde(rename = "filename")]
            file_name: String,
            key: String,
        }
        let data: VarData = self.decode(msg)?;
        let blob = self.app.store.blob();
        let env_map = match blob.read_file(&data.zone_id, &data.file_name).await {
            Ok(bytes) => env_to_map(&String::from_utf8_lossy(&bytes)),
            Err(_) => {
                return Ok(Handled::Done(Some(json!({
                    "key": data.key,
                    "exists": false,
                }))));
            }
        };
        let value = env_map.get(&data.key);
        Ok(Handled::Done(Some(json!({
            "key": data.key,
            "exists": value.is_some(),
            "val": value.cloned().unwrap_or_default(),
        }))))
    }

    async fn handle_set_var(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct VarData {
            #[serde(rename = "zoneid")]
            zone_id: String,
            #[serde(rename = "filename")]
            file_name: String,
            key: String,
            #[serde(default)]
            val: String,
            #[serde(default)]
            remove: bool,
        }
        let data: VarData = self.decode(msg)?;
        let blob = self.app.store.blob();
        let mut env_map = match blob.read_file(&data.zone_id, &data.file_name).await {
            Ok(bytes) => env_to_map(&String::from_utf8_lossy(&bytes)),
            Err(_) => HashMap::new(),
        };
        if data.remove {
            env_map.remove(&data.key);
        } else {
            env_map.insert(data.key.clone(), data.val.clone());
        }
        blob.write_file(&data.zone_id, &data.file_name, map_to_env(&env_map).as_bytes())
            .await?;
        Ok(Handled::Done(None))
    }

    async fn handle_get_tab(&self, msg: &RpcMessage) -> Result<Handled> {
        let tab_id: String = self.decode(msg)?;
        let mut tx = self.app.store.begin().await?;
        let tab = tx.get_tab(&tab_id).await.context("error getting tab")?;
        tx.commit().await?;
        Ok(Handled::Done(Some(serde_json::to_value(StarObj::from(tab))?)))
    }

    fn handle_wsh_activity(&self, msg: &RpcMessage) -> Result<Handled> {
        let data: HashMap<String, i64> = self.decode(msg)?;
        if !data.is_empty() {
            self.app.telemetry.record_wsh_activity(data);
        }
        Ok(Handled::Done(None))
    }

    fn handle_activity(&self, msg: &RpcMessage) -> Result<Handled> {
        let update: ActivityUpdate = self.decode(msg)?;
        self.app.telemetry.update_activity(update);
        Ok(Handled::Done(None))
    }

    async fn handle_path(&self, msg: &RpcMessage) -> Result<Handled> {
        #[derive(Deserialize)]
        struct PathData {
            #[serde(rename = "pathtype")]
            path_type: String,
            #[serde(default)]
            open: bool,
            #[serde(rename = "openexternal", default)]
            open_external: bool,
            #[serde(rename = "tabid", default)]
            tab_id: String,
        }
        let data: PathData = self.decode(msg)?;
        let path = match data.path_type.as_str() {
            "config" => self.app.paths.config_dir.clone(),
            "data" => self.app.paths.data_dir.clone(),
            "log" => self.app.paths.data_dir.join("starapp.log"),
            other => bail!("unknown path type: {other:?}"),
        };
        if data.open && data.open_external {
            bail!("open and openExternal cannot both be true");
        }
        if data.open {
            if data.tab_id.is_empty() {
                bail!("no tab to open path in");
            }
            let block_def = BlockDef {
                meta: [
                    (META_KEY_VIEW.to_string(), json!("preview")),
                    (META_KEY_FILE.to_string(), json!(path.display().to_string())),
                ]
                .into_iter()
                .collect(),
                ..Default::default()
            };
            let mut tx = self.app.store.begin().await?;
            let block = core::create_block(&mut tx, &data.tab_id, &block_def, None).await?;
            core::queue_layout_action_for_tab(
                &mut tx,
                &data.tab_id,
                vec![crate::obj::LayoutActionData {
                    action_type: core::ACTION_INSERT.to_string(),
                    block_id: block.oid,
                    ephemeral: true,
                    focused: true,
                    ..Default::default()
                }],
            )
            .await?;
            let updates = tx.commit().await?;
            self.app.broker.send_update_events(&updates);
        } else if data.open_external {
            info!("external open requested for {}", path.display());
        }
        Ok(Handled::Done(Some(json!(path.display().to_string()))))
    }
}

/// Parse an env-format blob file (`KEY=value` lines).
fn env_to_map(data: &str) -> HashMap<String, String> {
    data.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn map_to_env(map: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        out.push_str(&map[key]);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_map_roundtrip() {
        let env = "PATH=/usr/bin\nHOME=/home/user\nEMPTY=\nbad-line\n";
        let map = env_to_map(env);
        assert_eq!(map.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(map.get("EMPTY").unwrap(), "");
        assert_eq!(map.len(), 3);
        let out = map_to_env(&map);
        assert!(out.contains("HOME=/home/user\n"));
        let back = env_to_map(&out);
        assert_eq!(back, map);
    }
}
