//! `tandem-relay`: standalone relay process.
//!
//! Environment:
//! - `TANDEM_BIND`: listen address (default `127.0.0.1:9090`)
//! - `TANDEM_TOKENS`: comma-separated accepted tokens; unset accepts any
//! - `TANDEM_DATA`: RocksDB directory for snapshots (in-memory if unset)
//! - `RUST_LOG`: log filter, as usual for `env_logger`

use std::sync::Arc;

use log::info;
use tandem_collab::relay::{AllowAll, Relay, RelayConfig, StaticTokens, TokenValidator};
use tandem_collab::storage::{MemoryStore, SnapshotStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn open_store() -> Result<Arc<dyn SnapshotStore>, BoxError> {
    #[cfg(feature = "rocksdb")]
    if let Ok(path) = std::env::var("TANDEM_DATA") {
        use tandem_collab::storage::{RocksStore, StoreConfig};
        let store = RocksStore::open(StoreConfig {
            path: path.into(),
            ..StoreConfig::default()
        })?;
        info!("Persisting snapshots under {}", store.path().display());
        return Ok(Arc::new(store));
    }
    info!("Keeping snapshots in memory");
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_BIND") {
        config.bind_addr = addr;
    }

    let validator: Arc<dyn TokenValidator> = match std::env::var("TANDEM_TOKENS") {
        Ok(list) => {
            let tokens = StaticTokens::parse(&list);
            info!("Accepting {} token(s)", tokens.len());
            Arc::new(tokens)
        }
        Err(_) => Arc::new(AllowAll),
    };

    info!("Starting tandem relay on {}...", config.bind_addr);
    let relay = Relay::build(config, Some(open_store()?), validator);
    relay.run().await
}
