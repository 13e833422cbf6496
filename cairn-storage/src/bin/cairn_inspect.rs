//! Inspect a directory-backed store.
//!
//! Replays the store read-only and prints every entity with its defaults
//! applied. Configuration comes from `CAIRN_*` environment variables; a
//! first argument overrides the store root.

use cairn_core::{StoreConfig, StoreResult};
use cairn_storage::encoding::format;
use cairn_storage::{DirectoryLogDriver, LayeredStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> StoreResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cairn=info,cairn_storage=info,cairn_events=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = StoreConfig::from_env().with_read_only(true);
    if let Some(root) = std::env::args().nth(1) {
        config = config.with_root(root);
    }
    config.validate()?;

    let driver = Arc::new(DirectoryLogDriver::from_config(&config)?);
    let store = LayeredStore::builder(driver).config(config.clone()).build()?;
    store.start().await?;
    store.ready().await;

    let defaults = store.defaults().engine().identifiers();
    tracing::info!(
        entities = store.identifiers().len(),
        defaults = defaults.len(),
        "Store replayed"
    );

    for identifier in store.identifiers() {
        let Some(doc) = store.effective(&identifier) else {
            continue;
        };
        let rendered = format::render(config.default_format, &doc)?;
        println!("--- {}", identifier);
        println!("{}", String::from_utf8_lossy(&rendered).trim_end());
    }
    for identifier in defaults {
        println!("--- defaults {}", identifier);
    }
    Ok(())
}
