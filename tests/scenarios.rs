//! End-to-end scenarios against an in-memory daemon: first-launch seeding,
//! block lifecycle through the service layer, scoped update events, and the
//! response-stream path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use starsrv::App;
use starsrv::base::Paths;
use starsrv::core;
use starsrv::obj::{META_KEY_VIEW, Tab, UIContext, Workspace};
use starsrv::pubsub::{EVENT_STAROBJ_UPDATE, SubscriptionRequest};
use starsrv::rpc::RpcMessage;
use starsrv::service::{WebCall, call_service};
use tokio::sync::mpsc;

async fn test_app() -> (Arc<App>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Paths::new(tmp.path().join("data"), tmp.path().join("config"));
    let app = App::init_in_memory(paths).await.unwrap();
    (app, tmp)
}

/// First-launch seeding plus AgreeTos (which applies the starter layout).
async fn seeded_app() -> (Arc<App>, tempfile::TempDir, Workspace, Tab) {
    let (app, tmp) = test_app().await;
    core::ensure_initial_data(&app.store).await.unwrap();
    let rtn = call_service(
        &app,
        WebCall {
            service: "client".into(),
            method: "AgreeTos".into(),
            ui_context: None,
            args: vec![],
        },
    )
    .await;
    assert!(rtn.success, "AgreeTos failed: {}", rtn.error);

    let mut tx = app.store.begin().await.unwrap();
    let client = tx.get_client().await.unwrap();
    let window = tx.get_window(&client.window_ids[0]).await.unwrap();
    let workspace = tx.get_workspace(&window.workspace_id).await.unwrap();
    let tab = tx.get_tab(&workspace.active_tab_id).await.unwrap();
    tx.commit().await.unwrap();
    (app, tmp, workspace, tab)
}

#[tokio::test]
async fn s1_first_launch_seeds_starter_workspace() {
    let (app, _tmp, workspace, tab) = seeded_app().await;

    let mut tx = app.store.begin().await.unwrap();
    let client = tx.get_client().await.unwrap();
    assert!(uuid::Uuid::parse_str(&client.oid).is_ok());
    assert_eq!(client.window_ids.len(), 1);

    assert_eq!(workspace.name, "Starter workspace");
    assert_eq!(workspace.color, "#58C142");
    assert_eq!(workspace.icon, "custom@star-logo-solid");
    assert_eq!(workspace.active_tab_id, tab.oid);

    let mut views = Vec::new();
    let mut web_url = String::new();
    for block_id in &tab.block_ids {
        let block = tx.get_block(block_id).await.unwrap();
        let view = block.meta.get_string(META_KEY_VIEW, "");
        if view == "web" {
            web_url = block.meta.get_string("url", "");
        }
        views.push(view);
    }
    views.sort();
    let mut expected = vec![
        "help", "preview", "starai", "sysinfo", "term", "tips", "web",
    ];
    expected.sort();
    assert_eq!(views, expected);
    assert_eq!(web_url, "https://github.com/commandlinedev/starterm");

    // the starter layout was queued on the tab's layout state
    let layout = tx.get_layout(&tab.layout_state).await.unwrap();
    assert!(!layout.pending_backend_actions.is_empty());
    assert_eq!(layout.pending_backend_actions[0].action_type, "clear");
}

#[tokio::test]
async fn s2_create_block_appends_to_tab() {
    let (app, _tmp, _workspace, tab) = seeded_app().await;

    let rtn = call_service(
        &app,
        WebCall {
            service: "object".into(),
            method: "CreateBlock".into(),
            ui_context: Some(UIContext {
                window_id: String::new(),
                active_tab_id: tab.oid.clone(),
            }),
            args: vec![
                json!({"meta": {"view": "web", "url": "https://example"}}),
                Value::Null,
            ],
        },
    )
    .await;
    assert!(rtn.success, "CreateBlock failed: {}", rtn.error);
    let block_id = rtn.data.unwrap().as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&block_id).is_ok());

    let mut tx = app.store.begin().await.unwrap();
    let block = tx.get_block(&block_id).await.unwrap();
    assert_eq!(block.meta.get_string("view", ""), "web");
    assert_eq!(block.meta.get_string("url", ""), "https://example");
    let tab = tx.get_tab(&tab.oid).await.unwrap();
    assert_eq!(tab.block_ids.last().unwrap(), &block_id);
}

#[tokio::test]
async fn s3_set_meta_publishes_one_scoped_update() {
    let (app, _tmp, _workspace, tab) = seeded_app().await;
    let block_id = tab.block_ids[0].clone();
    let before_version = {
        let mut tx = app.store.begin().await.unwrap();
        tx.get_block(&block_id).await.unwrap().version
    };

    let mut rx = app.broker.register_client("test-sub");
    app.broker.subscribe(
        "test-sub",
        SubscriptionRequest {
            event: EVENT_STAROBJ_UPDATE.into(),
            scopes: vec![format!("block:{block_id}")],
            all_scopes: false,
        },
    );

    let rtn = call_service(
        &app,
        WebCall {
            service: "object".into(),
            method: "UpdateObjectMeta".into(),
            ui_context: Some(UIContext::default()),
            args: vec![
                json!(format!("block:{block_id}")),
                json!({"view": "preview"}),
            ],
        },
    )
    .await;
    assert!(rtn.success, "UpdateObjectMeta failed: {}", rtn.error);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event, EVENT_STAROBJ_UPDATE);
    assert_eq!(event.scopes, vec![format!("block:{block_id}")]);
    let data = event.data.unwrap();
    assert_eq!(data["obj"]["meta"]["view"], "preview");
    assert_eq!(data["obj"]["version"], json!(before_version + 1));
    // exactly one event for this scope
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn s4_recursive_delete_cascades_to_empty_tab() {
    let (app, _tmp, workspace, _tab) = seeded_app().await;

    // a fresh tab with a single block
    let rtn = call_service(
        &app,
        WebCall {
            service: "workspace".into(),
            method: "CreateTab".into(),
            ui_context: None,
            args: vec![json!(workspace.oid), json!("doomed"), json!(false), json!(false)],
        },
    )
    .await;
    assert!(rtn.success, "CreateTab failed: {}", rtn.error);
    let tab_id = rtn.data.unwrap().as_str().unwrap().to_string();

    let block_id = {
        let mut tx = app.store.begin().await.unwrap();
        let tab = tx.get_tab(&tab_id).await.unwrap();
        assert_eq!(tab.block_ids.len(), 1);
        let id = tab.block_ids[0].clone();
        tx.commit().await.unwrap();
        id
    };

    let rtn = call_service(
        &app,
        WebCall {
            service: "object".into(),
            method: "DeleteBlock".into(),
            ui_context: Some(UIContext::default()),
            args: vec![json!(block_id)],
        },
    )
    .await;
    assert!(rtn.success, "DeleteBlock failed: {}", rtn.error);

    let deletes: Vec<String> = rtn
        .updates
        .iter()
        .filter(|u| u.update_type == starsrv::obj::UpdateType::Delete)
        .map(|u| u.oref().to_string())
        .collect();
    assert!(deletes.contains(&format!("block:{block_id}")));
    assert!(deletes.contains(&format!("tab:{tab_id}")));

    let mut tx = app.store.begin().await.unwrap();
    let err = tx.find_tab_for_block(&block_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(tx.get_tab(&tab_id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn s5_concurrent_updates_serialize() {
    let (app, _tmp, _workspace, tab) = seeded_app().await;
    let tab_id = tab.oid.clone();
    let base_version = tab.version;

    let mut handles = Vec::new();
    for i in 0..2 {
        let app = app.clone();
        let tab_id = tab_id.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = app.store.begin().await.unwrap();
            let mut tab = tx.get_tab(&tab_id).await.unwrap();
            tab.name = format!("racer-{i}");
            let mut obj = starsrv::obj::StarObj::from(tab);
            tx.update(&mut obj).await.unwrap();
            tx.commit().await.unwrap();
            obj.version()
        }));
    }
    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort();
    assert_eq!(versions, vec![base_version + 1, base_version + 2]);

    let mut tx = app.store.begin().await.unwrap();
    let stored = tx.get_tab(&tab_id).await.unwrap();
    assert_eq!(stored.version, base_version + 2);
}

/// Register a fake peer route and return its inbound frame channel.
fn fake_peer(app: &Arc<App>, route: &str) -> mpsc::Receiver<RpcMessage> {
    let (tx, rx) = mpsc::channel(32);
    app.router.register_route(route, tx);
    rx
}

#[tokio::test]
async fn daemon_originated_call_roundtrips_through_default_route() {
    let (app, _tmp) = test_app().await;
    core::ensure_initial_data(&app.store).await.unwrap();

    let result = app
        .router
        .send_command("", "starinfo", None, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["version"], starsrv::base::STAR_VERSION);
    assert!(result["clientid"].is_string());

    let err = app
        .router
        .send_command("", "nosuchcommand", None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown command"));
}

#[tokio::test]
async fn s6_stream_test_delivers_chunks_in_order() {
    let (app, _tmp) = test_app().await;
    let mut rx = fake_peer(&app, "proc:testpeer");

    app.router.deliver(RpcMessage {
        command: "streamtest".into(),
        reqid: "st1".into(),
        source: "proc:testpeer".into(),
        ..Default::default()
    });

    let mut chunks = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream stalled")
            .expect("peer channel closed");
        assert_eq!(frame.resid, "st1");
        if frame.cont {
            chunks.push(frame.data.unwrap());
        } else {
            assert!(frame.error.is_empty());
            break;
        }
    }
    assert_eq!(chunks, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
}

#[tokio::test]
async fn s6_stream_test_cancellation() {
    let (app, _tmp) = test_app().await;
    let mut rx = fake_peer(&app, "proc:canceler");

    app.router.deliver(RpcMessage {
        command: "streamtest".into(),
        reqid: "st2".into(),
        source: "proc:canceler".into(),
        ..Default::default()
    });

    // take two chunks, then cancel
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.cont);
    }
    app.router.deliver(RpcMessage {
        reqid: "st2".into(),
        cancel: true,
        ..Default::default()
    });

    // at most one further chunk before the canceled terminal
    let mut extra_chunks = 0;
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if frame.cont {
            extra_chunks += 1;
            continue;
        }
        assert_eq!(frame.error, "canceled");
        break;
    }
    assert!(extra_chunks <= 1, "got {extra_chunks} chunks after cancel");
}
