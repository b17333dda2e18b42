use crate::retries::RetryConfig;
use crate::tracing::TracingConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub grpc_port: u16,
    /// Root for all persisted metadata paths inside the blob backend.
    pub db_path: PathBuf,
    pub storage: BlobStorageConfig,
    pub prefetch_table_metadata: bool,
    /// How long the driver tolerates having unfinished work but no active
    /// workers before failing the bulk job.
    #[serde(with = "humantime_serde")]
    pub no_workers_timeout: Duration,
    pub watchdog_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub watchdog_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub worker_ping_interval: Duration,
    pub failed_pings_before_removal: u32,
    pub task_failures_before_blacklist: u32,
    pub retries: RetryConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("frameflow-master"),
            http_port: 8080,
            grpc_port: 8081,
            db_path: PathBuf::from("frameflow_db"),
            storage: BlobStorageConfig::default(),
            prefetch_table_metadata: true,
            no_workers_timeout: Duration::from_secs(30),
            watchdog_enabled: false,
            watchdog_timeout: Duration::from_secs(30),
            worker_ping_interval: Duration::from_secs(5),
            failed_pings_before_removal: 3,
            task_failures_before_blacklist: 5,
            retries: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum BlobStorageConfig {
    #[default]
    Filesystem,
    InMemory,
}

pub struct ConfigLoader<T: Serialize + DeserializeOwned + Default> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("FRAMEFLOW__").split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps the defaults as TOML and returns `None`
    /// when invoked with `--dump-config-default`.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config-default") {
            match toml::to_string_pretty(&T::default()) {
                Ok(dump) => println!("{dump}"),
                Err(err) => eprintln!("Failed to serialize default config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<MasterConfig> {
    ConfigLoader::new(&PathBuf::from("config/frameflow-master.toml"))
}

#[cfg(test)]
mod tests {
    use crate::config::make_config_loader;
    use std::env;
    use std::path::PathBuf;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
