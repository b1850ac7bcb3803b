//! Property-style tests over the object store: version monotonicity,
//! referential integrity, order preservation, and update capture.

use std::sync::Arc;

use starsrv::blob::DirBlobStore;
use starsrv::obj::{Block, ORef, OTYPE_BLOCK, OTYPE_TAB, StarObj, Tab, UpdateType};
use starsrv::store::Store;
use uuid::Uuid;

async fn test_store() -> (Store, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let blob = Arc::new(DirBlobStore::new(tmp.path().join("blob")));
    let store = Store::in_memory(blob).await.unwrap();
    (store, tmp)
}

#[tokio::test]
async fn version_increments_once_per_update() {
    let (store, _tmp) = test_store().await;
    let oid = Uuid::new_v4().to_string();
    let mut tx = store.begin().await.unwrap();
    let mut obj = StarObj::from(Tab {
        oid: oid.clone(),
        ..Default::default()
    });
    tx.insert(&mut obj).await.unwrap();
    let initial = obj.version();

    let k = 7;
    for i in 1..=k {
        let mut tab: Tab = tx
            .get(&ORef::new(OTYPE_TAB, oid.clone()))
            .await
            .unwrap()
            .unwrap()
            .try_into()
            .unwrap();
        tab.name = format!("name-{i}");
        let mut obj = StarObj::from(tab);
        tx.update(&mut obj).await.unwrap();
        assert_eq!(obj.version(), initial + i);
    }
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let stored = tx
        .get(&ORef::new(OTYPE_TAB, oid))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version(), initial + k);
}

#[tokio::test]
async fn parent_refs_stay_consistent() {
    let (store, _tmp) = test_store().await;
    let tab_id = Uuid::new_v4().to_string();
    let block_a = Uuid::new_v4().to_string();
    let block_b = Uuid::new_v4().to_string();

    let mut tx = store.begin().await.unwrap();
    let mut tab = StarObj::from(Tab {
        oid: tab_id.clone(),
        block_ids: vec![block_a.clone(), block_b.clone()],
        ..Default::default()
    });
    tx.insert(&mut tab).await.unwrap();
    for block_id in [&block_a, &block_b] {
        let mut block = StarObj::from(Block {
            oid: block_id.clone(),
            parent_oref: ORef::new(OTYPE_TAB, tab_id.clone()).to_string(),
            ..Default::default()
        });
        tx.insert(&mut block).await.unwrap();
    }
    tx.commit().await.unwrap();

    // for every block, its parentoref resolves to a tab whose blockids
    // contain the block
    let mut tx = store.begin().await.unwrap();
    for block_id in [&block_a, &block_b] {
        let block = tx.get_block(block_id).await.unwrap();
        let parent: ORef = block.parent_oref.parse().unwrap();
        assert_eq!(parent.otype, OTYPE_TAB);
        let tab = tx.get_tab(&parent.oid).await.unwrap();
        assert!(tab.block_ids.contains(block_id));
    }
}

#[tokio::test]
async fn block_order_preserved_without_duplicates() {
    let (store, _tmp) = test_store().await;
    let tab_id = Uuid::new_v4().to_string();
    let ids: Vec<String> = (0..5).map(|_| Uuid::new_v4().to_string()).collect();

    let mut tx = store.begin().await.unwrap();
    let mut tab = StarObj::from(Tab {
        oid: tab_id.clone(),
        ..Default::default()
    });
    tx.insert(&mut tab).await.unwrap();

    // append in order, then remove the middle element
    let mut tab: Tab = tx
        .get(&ORef::new(OTYPE_TAB, tab_id.clone()))
        .await
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap();
    for id in &ids {
        tab.block_ids.push(id.clone());
    }
    tab.block_ids.retain(|id| id != &ids[2]);
    let mut obj = StarObj::from(tab);
    tx.update(&mut obj).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let tab = tx.get_tab(&tab_id).await.unwrap();
    let expected: Vec<&String> = ids.iter().enumerate().filter(|(i, _)| *i != 2).map(|(_, id)| id).collect();
    assert_eq!(tab.block_ids.iter().collect::<Vec<_>>(), expected);
    let mut dedup = tab.block_ids.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), tab.block_ids.len());
}

#[tokio::test]
async fn stored_objects_roundtrip_ignoring_version() {
    let (store, _tmp) = test_store().await;
    let block = Block {
        oid: Uuid::new_v4().to_string(),
        parent_oref: format!("tab:{}", Uuid::new_v4()),
        meta: [
            ("view".to_string(), serde_json::json!("web")),
            ("url".to_string(), serde_json::json!("https://example")),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let mut tx = store.begin().await.unwrap();
    let mut obj = StarObj::from(block.clone());
    tx.insert(&mut obj).await.unwrap();
    let fetched: Block = tx
        .get(&ORef::new(OTYPE_BLOCK, block.oid.clone()))
        .await
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap();
    let mut expected = block;
    expected.version = fetched.version;
    assert_eq!(fetched, expected);
}

#[tokio::test]
async fn update_capture_matches_rows_changed() {
    let (store, _tmp) = test_store().await;
    let tab_id = Uuid::new_v4().to_string();
    let block_id = Uuid::new_v4().to_string();

    let mut tx = store.begin().await.unwrap();
    let mut tab = StarObj::from(Tab {
        oid: tab_id.clone(),
        ..Default::default()
    });
    tx.insert(&mut tab).await.unwrap();
    let mut block = StarObj::from(Block {
        oid: block_id.clone(),
        parent_oref: ORef::new(OTYPE_TAB, tab_id.clone()).to_string(),
        ..Default::default()
    });
    tx.insert(&mut block).await.unwrap();
    tx.delete(OTYPE_BLOCK, &block_id).await.unwrap();
    let updates = tx.commit().await.unwrap();

    let described: Vec<(String, UpdateType)> = updates
        .iter()
        .map(|u| (u.oref().to_string(), u.update_type))
        .collect();
    assert_eq!(
        described,
        vec![
            (format!("tab:{tab_id}"), UpdateType::Update),
            (format!("block:{block_id}"), UpdateType::Update),
            (format!("block:{block_id}"), UpdateType::Delete),
        ]
    );
    // update records carry the object, delete records do not
    assert!(updates[0].obj.is_some());
    assert!(updates[2].obj.is_none());
}
