use config::FileFormat;
use lazy_static_include::*;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Coordinator's worker-facing endpoint.
    pub scheduler_address: String,

    /// Address this worker serves peer fetches on.
    pub listen_address: String,

    /// Name announced in the registration metadata.
    pub name: String,

    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_address: "tcp://127.0.0.1:8786".to_string(),
            listen_address: "tcp://127.0.0.1:0".to_string(),
            name: "worker".to_string(),
            poll_interval_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) {
        assert!(
            self.scheduler_address.starts_with("tcp://"),
            "Scheduler address must be a tcp:// endpoint"
        );
        assert!(
            self.listen_address.starts_with("tcp://"),
            "Listen address must be a tcp:// endpoint"
        );
        assert!(!self.name.is_empty(), "Worker name is required");
        assert!(self.poll_interval_ms > 0, "Poll interval is required");
    }
}

impl Config {
    pub fn load(local_file: Option<String>) -> Config {
        let mut config_builder = config::Config::builder();
        config_builder = config_builder.add_source(config::File::from_str(
            &DEFAULT_CONFIG,
            FileFormat::Toml,
        ));

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        let config_builder = config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .expect("Could not load configuration");

        config_builder
            .try_deserialize()
            .expect("Could not deserialize configuration")
    }

    pub fn validate(&self) {
        self.worker.validate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let config = Config::load(None);
        config.validate();
        assert_eq!(config.worker.name, "worker");
    }
}
