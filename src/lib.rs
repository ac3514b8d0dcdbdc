pub mod config;
pub mod db;
pub mod error;
pub mod invision;
pub mod migration;
pub mod test_support;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Initialize `env_logger` once. `RUST_LOG` overrides the default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}
