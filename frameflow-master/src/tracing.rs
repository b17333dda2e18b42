use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    /// Default filter directive when `RUST_LOG` is not set.
    pub default_directive: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            default_directive: "info".to_string(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("frameflow")
    }
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
