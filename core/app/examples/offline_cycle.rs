//! Walk through the offline-first cycle against the in-memory backends:
//! create while offline, reconnect, watch the outbox drain and the
//! temporary id give way to the server-assigned one.
//!
//! Run with: cargo run -p satchel-app --example offline_cycle

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use satchel_app::{EngineConfig, SyncContext};
use satchel_common::{CollectionName, CollectionSpec, Result};
use satchel_remote::MemoryRemote;
use satchel_storage::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let products = CollectionName::new("products")?;
    let clients = CollectionName::new("clients")?;
    let config = EngineConfig::new(
        "http://localhost:4000/",
        vec![
            CollectionSpec::new(products.clone(), "api/products"),
            CollectionSpec::new(clients.clone(), "api/clients"),
        ],
    );

    let store = Arc::new(MemoryStore::new(vec![products.clone(), clients]));
    let remote = Arc::new(MemoryRemote::new());
    let mut context = SyncContext::new(config, store, remote.clone())?;
    context.start()?;
    let facade = context.facade();

    // The link goes down; the widget still gets created.
    context.monitor().set_online(false);
    let widget = facade
        .create(&products, json!({"name": "Widget", "qty": 5}))
        .await?;
    println!("created offline under temporary id {}", widget.id);

    // Back online: the reconnect trigger replays the outbox.
    context.monitor().set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = context.scheduler().request_sync().await?;
    println!(
        "sync finished: {} pushed, {} pulled, clean = {}",
        report.pushed,
        report.pulled,
        report.is_clean()
    );

    for record in facade.get_all(&products).await? {
        println!("local record {} => {}", record.id, record.payload);
    }
    for remote_record in remote.snapshot(&products) {
        println!("remote record {} => {}", remote_record.id, remote_record.payload);
    }

    context.stop().await;
    Ok(())
}
