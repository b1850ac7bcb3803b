//! Block lifecycle: creation (top-level and sub-blocks), recursive deletion
//! with parent bookkeeping, and the empty-tab cascade.

use anyhow::{Context, Result, bail};
use log::debug;
use uuid::Uuid;

use crate::obj::{
    Block, BlockDef, META_KEY_VIEW, ORef, OTYPE_BLOCK, OTYPE_TAB, RuntimeOpts, parse_oref_opt,
};
use crate::pubsub::{Broker, EVENT_BLOCK_CLOSE, StarEvent};
use crate::store::StoreTx;

/// Create a block under a tab. The block def must name a view.
pub async fn create_block(
    tx: &mut StoreTx,
    tab_id: &str,
    block_def: &BlockDef,
    rt_opts: Option<RuntimeOpts>,
) -> Result<Block> {
    if block_def.meta.get_string(META_KEY_VIEW, "").is_empty() {
        bail!("no view provided for new block");
    }
    let mut tab = tx.get_tab(tab_id).await.context("tab not found")?;
    let block = Block {
        oid: Uuid::new_v4().to_string(),
        parent_oref: ORef::new(OTYPE_TAB, tab_id).to_string(),
        runtime_opts: rt_opts,
        meta: block_def.meta.clone(),
        ..Default::default()
    };
    tx.insert_obj(block.clone()).await?;
    tab.block_ids.push(block.oid.clone());
    tx.update_obj(tab).await?;
    Ok(block)
}

/// Create a sub-block under an existing block.
pub async fn create_sub_block(
    tx: &mut StoreTx,
    parent_block_id: &str,
    block_def: &BlockDef,
) -> Result<Block> {
    if block_def.meta.get_string(META_KEY_VIEW, "").is_empty() {
        bail!("no view provided for new block");
    }
    let mut parent = tx
        .get_block(parent_block_id)
        .await
        .context("parent block not found")?;
    let block = Block {
        oid: Uuid::new_v4().to_string(),
        parent_oref: ORef::new(OTYPE_BLOCK, parent_block_id).to_string(),
        meta: block_def.meta.clone(),
        ..Default::default()
    };
    tx.insert_obj(block.clone()).await?;
    parent.sub_block_ids.push(block.oid.clone());
    tx.update_obj(parent).await?;
    Ok(block)
}

/// Reject a reparenting where the proposed parent is a descendant of the
/// child, which would create a cycle in the block tree.
pub async fn ensure_not_descendant(
    tx: &mut StoreTx,
    parent_id: &str,
    child_id: &str,
) -> Result<()> {
    let mut current = parent_id.to_string();
    for _ in 0..6 {
        if current == child_id {
            bail!("cannot reparent: {parent_id:?} is a descendant of {child_id:?}");
        }
        let block = match tx.get_block(&current).await {
            Ok(b) => b,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(oref) = parse_oref_opt(&block.parent_oref) else {
            return Ok(());
        };
        if oref.otype != OTYPE_BLOCK {
            return Ok(());
        }
        current = oref.oid;
    }
    bail!("block parent chain too deep");
}

/// Outcome of a recursive block deletion, reported so callers can hydrate
/// the UI after a cascade.
#[derive(Debug, Clone, Default)]
pub struct DeleteBlockResult {
    pub deleted_tab_id: Option<String>,
    pub new_active_tab_id: Option<String>,
}

/// Delete a block and its sub-blocks (depth-first). With `recursive`, a tab
/// left empty by the deletion is removed too, and the workspace's new active
/// tab is reported.
pub async fn delete_block(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    block_id: &str,
    recursive: bool,
) -> Result<DeleteBlockResult> {
    let block = tx.get_block(block_id).await.context("error getting block")?;
    let parent_oref = parse_oref_opt(&block.parent_oref);
    delete_block_tree(tx, broker, controllers, block_id).await?;
    let mut rtn = DeleteBlockResult::default();

    if let Some(parent) = parent_oref {
        if recursive && parent.otype == OTYPE_TAB {
            let tab = tx.get_tab(&parent.oid).await?;
            if tab.block_ids.is_empty() {
                debug!("parent tab {} has no blocks, deleting tab", parent.oid);
                let workspace_id = tx
                    .find_workspace_for_tab(&parent.oid)
                    .await
                    .context("error finding workspace for tab to delete")?;
                let new_active =
                    super::delete_tab(tx, broker, controllers, &workspace_id, &parent.oid).await?;
                super::send_active_tab_update(broker, &workspace_id, &new_active);
                rtn.deleted_tab_id = Some(parent.oid);
                rtn.new_active_tab_id = Some(new_active);
            }
        }
    }
    Ok(rtn)
}

/// Delete a block subtree, leaves first, fixing up each parent's id list and
/// stopping any attached controllers. Used both directly and by tab deletion.
pub(crate) async fn delete_block_tree(
    tx: &mut StoreTx,
    broker: &Broker,
    controllers: &dyn super::BlockControllerHost,
    block_id: &str,
) -> Result<()> {
    // collect the subtree in discovery order, then delete in reverse so
    // sub-blocks always go before their parent
    let mut order = vec![block_id.to_string()];
    let mut idx = 0;
    while idx < order.len() {
        let block = tx.get_block(&order[idx]).await?;
        order.extend(block.sub_block_ids.iter().cloned());
        idx += 1;
        if idx > 64 {
            bail!("block subtree too large");
        }
    }
    for id in order.iter().rev() {
        delete_block_obj(tx, id).await?;
        controllers.stop_controller(id);
        broker.publish(StarEvent {
            event: EVENT_BLOCK_CLOSE.to_string(),
            sender: String::new(),
            scopes: vec![ORef::new(OTYPE_BLOCK, id.clone()).to_string()],
            data: Some(serde_json::json!(id)),
        });
    }
    Ok(())
}

/// Delete a single block row after detaching it from its parent. The block
/// must have no sub-blocks left.
async fn delete_block_obj(tx: &mut StoreTx, block_id: &str) -> Result<()> {
    let block = tx.get_block(block_id).await.context("block not found")?;
    if !block.sub_block_ids.is_empty() {
        bail!("block has subblocks, must delete subblocks first");
    }
    if let Some(parent) = parse_oref_opt(&block.parent_oref) {
        match parent.otype.as_str() {
            OTYPE_TAB => {
                if let Ok(mut tab) = tx.get_tab(&parent.oid).await {
                    tab.block_ids.retain(|id| id != block_id);
                    tx.update_obj(tab).await?;
                }
            }
            OTYPE_BLOCK => {
                if let Ok(mut parent_block) = tx.get_block(&parent.oid).await {
                    parent_block.sub_block_ids.retain(|id| id != block_id);
                    tx.update_obj(parent_block).await?;
                }
            }
            _ => {}
        }
    }
    tx.delete(OTYPE_BLOCK, block_id).await?;
    Ok(())
}
