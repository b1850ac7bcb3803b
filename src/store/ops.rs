//! Store operations. All run on an open [`StoreTx`]; queries against the
//! serialized JSON use SQLite's json_extract/json_each.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::Row;

use super::{StoreError, StoreResult, StoreTx};
use crate::obj::{
    ALL_OTYPES, Block, Client, LayoutState, MetaMap, ORef, OTYPE_BLOCK, OTYPE_CLIENT, OTYPE_TAB,
    StarObj, Tab, UpdateRecord, Window, Workspace, merge_meta,
};

static VIEW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{1,20}$").unwrap());

/// Maximum parent hops when walking from a block up to its tab.
const MAX_PARENT_HOPS: usize = 5;

fn table_name(otype: &str) -> StoreResult<String> {
    if !ALL_OTYPES.contains(&otype) {
        return Err(StoreError::BadORef(format!("unknown object type: {otype:?}")));
    }
    Ok(format!("db_{otype}"))
}

fn decode_row(otype: &str, oid: &str, version: i64, data: &str) -> StoreResult<StarObj> {
    let mut obj: StarObj =
        serde_json::from_str(data).map_err(|source| StoreError::CorruptRow {
            otype: otype.to_string(),
            oid: oid.to_string(),
            source,
        })?;
    if obj.otype() != otype {
        return Err(StoreError::Invalid(format!(
            "type tag mismatch in {otype} row {oid}: data says {}",
            obj.otype()
        )));
    }
    obj.set_version(version);
    Ok(obj)
}

impl StoreTx {
    pub async fn get(&mut self, oref: &ORef) -> StoreResult<Option<StarObj>> {
        let table = table_name(&oref.otype)?;
        let query = format!("SELECT oid, version, data FROM {table} WHERE oid = ?");
        let row = sqlx::query(&query)
            .bind(&oref.oid)
            .fetch_optional(self.conn())
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let version: i64 = row.get("version");
                let data: String = row.get("data");
                Ok(Some(decode_row(&oref.otype, &oref.oid, version, &data)?))
            }
        }
    }

    pub async fn must_get(&mut self, oref: &ORef) -> StoreResult<StarObj> {
        self.get(oref).await?.ok_or(StoreError::NotFound)
    }

    pub async fn get_singleton(&mut self, otype: &str) -> StoreResult<StarObj> {
        let table = table_name(otype)?;
        let query = format!("SELECT oid, version, data FROM {table} LIMIT 1");
        let row = sqlx::query(&query)
            .fetch_optional(self.conn())
            .await?
            .ok_or(StoreError::NotFound)?;
        let oid: String = row.get("oid");
        let version: i64 = row.get("version");
        let data: String = row.get("data");
        decode_row(otype, &oid, version, &data)
    }

    pub async fn exists(&mut self, oref: &ORef) -> StoreResult<bool> {
        let table = table_name(&oref.otype)?;
        let query = format!("SELECT oid FROM {table} WHERE oid = ?");
        let row = sqlx::query(&query)
            .bind(&oref.oid)
            .fetch_optional(self.conn())
            .await?;
        Ok(row.is_some())
    }

    /// Insert a new row; the object's version is set to 1.
    pub async fn insert(&mut self, obj: &mut StarObj) -> StoreResult<()> {
        if obj.oid().is_empty() {
            return Err(StoreError::Invalid(format!(
                "cannot insert {} value with empty id",
                obj.otype()
            )));
        }
        let oref = obj.oref();
        if self.exists(&oref).await? {
            return Err(StoreError::Duplicate(oref.to_string()));
        }
        obj.set_version(1);
        let data = serde_json::to_string(obj).expect("star objects always serialize");
        let table = table_name(&oref.otype)?;
        let query = format!("INSERT INTO {table} (oid, version, data) VALUES (?, ?, ?)");
        sqlx::query(&query)
            .bind(&oref.oid)
            .bind(1_i64)
            .bind(&data)
            .execute(self.conn())
            .await?;
        self.add_update(UpdateRecord::update(obj));
        Ok(())
    }

    /// Update a row, bumping the version atomically and re-stamping `obj`.
    pub async fn update(&mut self, obj: &mut StarObj) -> StoreResult<()> {
        if obj.oid().is_empty() {
            return Err(StoreError::Invalid(format!(
                "cannot update {} value with empty id",
                obj.otype()
            )));
        }
        let oref = obj.oref();
        let data = serde_json::to_string(obj).expect("star objects always serialize");
        let table = table_name(&oref.otype)?;
        let query =
            format!("UPDATE {table} SET data = ?, version = version+1 WHERE oid = ? RETURNING version");
        let row = sqlx::query(&query)
            .bind(&data)
            .bind(&oref.oid)
            .fetch_optional(self.conn())
            .await?
            .ok_or(StoreError::NotFound)?;
        let new_version: i64 = row.get("version");
        obj.set_version(new_version);
        self.add_update(UpdateRecord::update(obj));
        Ok(())
    }

    /// Delete a row and queue its blob zone for post-commit removal.
    pub async fn delete(&mut self, otype: &str, oid: &str) -> StoreResult<()> {
        let table = table_name(otype)?;
        let query = format!("DELETE FROM {table} WHERE oid = ?");
        sqlx::query(&query).bind(oid).execute(self.conn()).await?;
        self.add_update(UpdateRecord::delete(otype, oid));
        self.add_deleted_zone(oid.to_string());
        Ok(())
    }

    /// Batched fetch, grouped by type. Missing objects are skipped.
    pub async fn select_orefs(&mut self, orefs: &[ORef]) -> StoreResult<Vec<StarObj>> {
        let mut by_type: HashMap<&str, Vec<&str>> = HashMap::new();
        for oref in orefs {
            by_type
                .entry(oref.otype.as_str())
                .or_default()
                .push(oref.oid.as_str());
        }
        let mut rtn = Vec::with_capacity(orefs.len());
        for (otype, oids) in by_type {
            let table = table_name(otype)?;
            let query = format!(
                "SELECT oid, version, data FROM {table} \
                 WHERE oid IN (SELECT value FROM json_each(?))"
            );
            let oids_json = serde_json::to_string(&oids).expect("string slice serializes");
            let rows = sqlx::query(&query)
                .bind(&oids_json)
                .fetch_all(self.conn())
                .await?;
            for row in rows {
                let oid: String = row.get("oid");
                let version: i64 = row.get("version");
                let data: String = row.get("data");
                rtn.push(decode_row(otype, &oid, version, &data)?);
            }
        }
        Ok(rtn)
    }

    pub async fn get_all_oids(&mut self, otype: &str) -> StoreResult<Vec<String>> {
        let table = table_name(otype)?;
        let query = format!("SELECT oid FROM {table}");
        let rows = sqlx::query(&query).fetch_all(self.conn()).await?;
        Ok(rows.into_iter().map(|row| row.get("oid")).collect())
    }

    pub async fn get_count(&mut self, otype: &str) -> StoreResult<i64> {
        let table = table_name(otype)?;
        let query = format!("SELECT count(*) AS c FROM {table}");
        let row = sqlx::query(&query).fetch_one(self.conn()).await?;
        Ok(row.get("c"))
    }

    /// Returns (named workspaces, total workspaces).
    pub async fn get_ws_counts(&mut self) -> StoreResult<(i64, i64)> {
        let named: i64 = sqlx::query(
            "SELECT count(*) AS c FROM db_workspace \
             WHERE COALESCE(json_extract(data, '$.name'), '') <> ''",
        )
        .fetch_one(self.conn())
        .await?
        .get("c");
        let total: i64 = sqlx::query("SELECT count(*) AS c FROM db_workspace")
            .fetch_one(self.conn())
            .await?
            .get("c");
        Ok((named, total))
    }

    pub async fn get_block_view_counts(&mut self) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT COALESCE(json_extract(data, '$.meta.view'), '') AS view FROM db_block",
        )
        .fetch_all(self.conn())
        .await?;
        let mut rtn: HashMap<String, i64> = HashMap::new();
        for row in rows {
            let view: String = row.get("view");
            if view.is_empty() || !VIEW_RE.is_match(&view) {
                continue;
            }
            *rtn.entry(view).or_default() += 1;
        }
        Ok(rtn)
    }

    /// Resolve a full UUID or 8-char prefix against every type table.
    pub async fn resolve_easy_oid(&mut self, oid: &str) -> StoreResult<ORef> {
        for otype in ALL_OTYPES {
            let table = table_name(otype)?;
            let row = if oid.len() == 8 {
                let query = format!("SELECT oid FROM {table} WHERE oid LIKE ?");
                sqlx::query(&query)
                    .bind(format!("{oid}%"))
                    .fetch_optional(self.conn())
                    .await?
            } else {
                let query = format!("SELECT oid FROM {table} WHERE oid = ?");
                sqlx::query(&query)
                    .bind(oid)
                    .fetch_optional(self.conn())
                    .await?
            };
            if let Some(row) = row {
                let full_oid: String = row.get("oid");
                return Ok(ORef::new(*otype, full_oid));
            }
        }
        Err(StoreError::NotFound)
    }

    /// Walk up the parentoref chain from a block to its tab. The walk is
    /// bounded to [`MAX_PARENT_HOPS`]; a chain that loops or climbs past a
    /// tab is an error.
    pub async fn find_tab_for_block(&mut self, block_id: &str) -> StoreResult<String> {
        let mut current = block_id.to_string();
        for _ in 0..MAX_PARENT_HOPS {
            let row = sqlx::query(
                "SELECT json_extract(data, '$.parentoref') AS parentoref \
                 FROM db_block WHERE oid = ?",
            )
            .bind(&current)
            .fetch_optional(self.conn())
            .await?
            .ok_or(StoreError::NotFound)?;
            let parent_oref: Option<String> = row.get("parentoref");
            let parent_oref = parent_oref.unwrap_or_default();
            let oref: ORef = parent_oref
                .parse()
                .map_err(|e| StoreError::BadORef(format!("bad block parent oref: {e}")))?;
            match oref.otype.as_str() {
                OTYPE_TAB => return Ok(oref.oid),
                OTYPE_BLOCK => current = oref.oid,
                other => {
                    return Err(StoreError::BadORef(format!(
                        "bad parent oref type: {other}"
                    )));
                }
            }
        }
        Err(StoreError::Invalid(
            "too many iterations looking for tab in block parents".into(),
        ))
    }

    pub async fn find_workspace_for_tab(&mut self, tab_id: &str) -> StoreResult<String> {
        let row = sqlx::query(
            "SELECT w.oid AS oid FROM db_workspace w \
             WHERE EXISTS ( \
                 SELECT 1 FROM json_each(w.data, '$.tabids') AS je WHERE je.value = ?1 \
             ) OR EXISTS ( \
                 SELECT 1 FROM json_each(w.data, '$.pinnedtabids') AS je WHERE je.value = ?1 \
             )",
        )
        .bind(tab_id)
        .fetch_optional(self.conn())
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.get("oid"))
    }

    pub async fn find_window_for_workspace(&mut self, workspace_id: &str) -> StoreResult<String> {
        let row = sqlx::query(
            "SELECT oid FROM db_window WHERE json_extract(data, '$.workspaceid') = ?",
        )
        .bind(workspace_id)
        .fetch_optional(self.conn())
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.get("oid"))
    }

    /// Merge `meta` into an object's metadata and persist.
    pub async fn update_object_meta(
        &mut self,
        oref: &ORef,
        meta: &MetaMap,
        merge_special: bool,
    ) -> StoreResult<()> {
        if oref.is_empty() {
            return Err(StoreError::BadORef("empty object reference".into()));
        }
        let mut obj = self.must_get(oref).await?;
        let merged = merge_meta(obj.meta().clone(), meta, merge_special);
        obj.set_meta(merged);
        self.update(&mut obj).await
    }

    /// Reparent a block from one tab to another, keeping both tabs' block
    /// lists consistent.
    pub async fn move_block_to_tab(
        &mut self,
        current_tab_id: &str,
        new_tab_id: &str,
        block_id: &str,
    ) -> StoreResult<()> {
        let mut block = self.get_block(block_id).await?;
        let mut current_tab = self.get_tab(current_tab_id).await?;
        let mut new_tab = self.get_tab(new_tab_id).await?;
        if !current_tab.block_ids.iter().any(|id| id == block_id) {
            return Err(StoreError::Invalid(format!(
                "block not found in current tab: {block_id:?}"
            )));
        }
        current_tab.block_ids.retain(|id| id != block_id);
        new_tab.block_ids.push(block_id.to_string());
        block.parent_oref = ORef::new(OTYPE_TAB, new_tab_id).to_string();
        self.update_obj(block).await?;
        self.update_obj(current_tab).await?;
        self.update_obj(new_tab).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // typed helpers
    // ------------------------------------------------------------------

    pub(crate) async fn update_obj(&mut self, obj: impl Into<StarObj>) -> StoreResult<()> {
        let mut obj = obj.into();
        self.update(&mut obj).await
    }

    pub(crate) async fn insert_obj(&mut self, obj: impl Into<StarObj>) -> StoreResult<()> {
        let mut obj = obj.into();
        self.insert(&mut obj).await
    }

    async fn get_typed<T>(&mut self, otype: &str, oid: &str) -> StoreResult<T>
    where
        T: TryFrom<StarObj, Error = anyhow::Error>,
    {
        let obj = self.must_get(&ORef::new(otype, oid)).await?;
        T::try_from(obj).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    pub async fn get_client(&mut self) -> StoreResult<Client> {
        let obj = self.get_singleton(OTYPE_CLIENT).await?;
        Client::try_from(obj).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    pub async fn get_window(&mut self, oid: &str) -> StoreResult<Window> {
        self.get_typed(crate::obj::OTYPE_WINDOW, oid).await
    }

    pub async fn get_workspace(&mut self, oid: &str) -> StoreResult<Workspace> {
        self.get_typed(crate::obj::OTYPE_WORKSPACE, oid).await
    }

    pub async fn get_tab(&mut self, oid: &str) -> StoreResult<Tab> {
        self.get_typed(OTYPE_TAB, oid).await
    }

    pub async fn get_block(&mut self, oid: &str) -> StoreResult<Block> {
        self.get_typed(OTYPE_BLOCK, oid).await
    }

    pub async fn get_layout(&mut self, oid: &str) -> StoreResult<LayoutState> {
        self.get_typed(crate::obj::OTYPE_LAYOUT, oid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::DirBlobStore;
    use crate::store::Store;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let blob = Arc::new(DirBlobStore::new(tmp.path().join("blob")));
        let store = Store::in_memory(blob).await.unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn test_insert_get_update_delete() {
        let (store, _tmp) = test_store().await;
        let oid = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();

        let mut obj = StarObj::from(Tab {
            oid: oid.clone(),
            name: "first".into(),
            ..Default::default()
        });
        tx.insert(&mut obj).await.unwrap();
        assert_eq!(obj.version(), 1);

        let oref = ORef::new(OTYPE_TAB, oid.clone());
        let fetched = tx.get(&oref).await.unwrap().unwrap();
        assert_eq!(fetched.version(), 1);

        let mut tab: Tab = fetched.try_into().unwrap();
        tab.name = "renamed".into();
        let mut obj = StarObj::from(tab);
        tx.update(&mut obj).await.unwrap();
        assert_eq!(obj.version(), 2);

        tx.delete(OTYPE_TAB, &oid).await.unwrap();
        assert!(tx.get(&oref).await.unwrap().is_none());

        let updates = tx.commit().await.unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2].update_type, crate::obj::UpdateType::Delete);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let (store, _tmp) = test_store().await;
        let oid = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();
        let mut obj = StarObj::from(Tab {
            oid: oid.clone(),
            ..Default::default()
        });
        tx.insert(&mut obj).await.unwrap();
        let mut dup = StarObj::from(Tab {
            oid,
            ..Default::default()
        });
        let err = tx.insert(&mut dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let (store, _tmp) = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let mut obj = StarObj::from(Tab {
            oid: Uuid::new_v4().to_string(),
            ..Default::default()
        });
        let err = tx.update(&mut obj).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_tab_for_block_walks_parents() {
        let (store, _tmp) = test_store().await;
        let tab_id = Uuid::new_v4().to_string();
        let parent_id = Uuid::new_v4().to_string();
        let child_id = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();
        tx.insert_obj(Tab {
            oid: tab_id.clone(),
            block_ids: vec![parent_id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
        tx.insert_obj(Block {
            oid: parent_id.clone(),
            parent_oref: ORef::new(OTYPE_TAB, tab_id.clone()).to_string(),
            sub_block_ids: vec![child_id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
        tx.insert_obj(Block {
            oid: child_id.clone(),
            parent_oref: ORef::new(OTYPE_BLOCK, parent_id.clone()).to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(tx.find_tab_for_block(&child_id).await.unwrap(), tab_id);
        assert_eq!(tx.find_tab_for_block(&parent_id).await.unwrap(), tab_id);
        assert!(tx
            .find_tab_for_block(&Uuid::new_v4().to_string())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_easy_oid_prefix() {
        let (store, _tmp) = test_store().await;
        let oid = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();
        tx.insert_obj(Block {
            oid: oid.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

        let resolved = tx.resolve_easy_oid(&oid).await.unwrap();
        assert_eq!(resolved, ORef::new(OTYPE_BLOCK, oid.clone()));

        let resolved = tx.resolve_easy_oid(&oid[..8]).await.unwrap();
        assert_eq!(resolved.oid, oid);

        assert!(tx
            .resolve_easy_oid("ffffffff")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_block_view_counts_filters_invalid_views() {
        let (store, _tmp) = test_store().await;
        let mut tx = store.begin().await.unwrap();
        for view in ["term", "term", "web", "Not Valid!"] {
            tx.insert_obj(Block {
                oid: Uuid::new_v4().to_string(),
                meta: [("view".to_string(), serde_json::json!(view))]
                    .into_iter()
                    .collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let counts = tx.get_block_view_counts().await.unwrap();
        assert_eq!(counts.get("term"), Some(&2));
        assert_eq!(counts.get("web"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_updates() {
        let (store, _tmp) = test_store().await;
        let oid = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();
        tx.insert_obj(Tab {
            oid: oid.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .get(&ORef::new(OTYPE_TAB, oid))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_select_orefs_batches_by_type() {
        let (store, _tmp) = test_store().await;
        let tab_id = Uuid::new_v4().to_string();
        let block_id = Uuid::new_v4().to_string();
        let mut tx = store.begin().await.unwrap();
        tx.insert_obj(Tab {
            oid: tab_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        tx.insert_obj(Block {
            oid: block_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

        let objs = tx
            .select_orefs(&[
                ORef::new(OTYPE_TAB, tab_id),
                ORef::new(OTYPE_BLOCK, block_id),
                ORef::new(OTYPE_BLOCK, Uuid::new_v4().to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(objs.len(), 2);
    }
}
