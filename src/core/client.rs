//! Client singleton lifecycle and initial data seeding.

use anyhow::{Context, Result, bail};
use log::info;
use uuid::Uuid;

use crate::obj::Client;
use crate::store::{Store, StoreError, StoreTx};

/// Ensure the client singleton and at least one window exist. On first
/// launch this also creates the starter workspace. Returns the client.
pub async fn ensure_initial_data(store: &Store) -> Result<Client> {
    let mut tx = store.begin().await?;
    let mut first_launch = false;
    let mut client = match tx.get_client().await {
        Ok(client) => client,
        Err(StoreError::NotFound) => {
            first_launch = true;
            create_client(&mut tx).await?
        }
        Err(e) => return Err(e).context("loading client singleton"),
    };
    if client.temp_oid.is_empty() {
        client.temp_oid = Uuid::new_v4().to_string();
        let mut obj = crate::obj::StarObj::from(client.clone());
        tx.update(&mut obj).await?;
        client = obj.try_into()?;
    }
    info!("clientid: {}", client.oid);

    if !client.window_ids.is_empty() {
        tx.commit().await?;
        return Ok(client);
    }

    let mut ws_id = String::new();
    if first_launch {
        info!("first launch, creating starter workspace");
        let starter = super::create_workspace(
            &mut tx,
            "Starter workspace",
            "custom@star-logo-solid",
            "#58C142",
            false,
            true,
        )
        .await?;
        ws_id = starter.oid;
    }
    let window = super::create_window(&mut tx, None, &ws_id).await?;
    info!("created initial window {}", window.oid);
    tx.commit().await?;

    let mut tx = store.begin().await?;
    let client = tx.get_client().await?;
    tx.commit().await?;
    Ok(client)
}

pub async fn create_client(tx: &mut StoreTx) -> Result<Client> {
    let client = Client {
        oid: Uuid::new_v4().to_string(),
        window_ids: Vec::new(),
        ..Default::default()
    };
    let mut obj = crate::obj::StarObj::from(client.clone());
    tx.insert(&mut obj).await.context("inserting client")?;
    Ok(obj.try_into()?)
}

pub async fn get_client_data(tx: &mut StoreTx) -> Result<Client> {
    tx.get_client().await.context("getting client data")
}

/// Move a window to the front of the client's window order.
pub async fn focus_window(tx: &mut StoreTx, window_id: &str) -> Result<()> {
    let mut client = tx.get_client().await?;
    if !client.window_ids.iter().any(|id| id == window_id) {
        bail!("window not found: {window_id:?}");
    }
    client.window_ids.retain(|id| id != window_id);
    client.window_ids.insert(0, window_id.to_string());
    tx.update_obj(client).await?;
    Ok(())
}
