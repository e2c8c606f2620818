use config::FileFormat;
use lazy_static_include::*;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub scheduler: SchedulerConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Router endpoint workers connect to.
    pub worker_address: String,

    /// Router endpoint clients connect to.
    pub client_address: String,

    pub poll_interval_ms: u64,

    pub handler_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_address: "tcp://127.0.0.1:0".to_string(),
            client_address: "tcp://127.0.0.1:0".to_string(),
            poll_interval_ms: 100,
            handler_pool_size: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) {
        assert!(
            self.worker_address.starts_with("tcp://"),
            "Worker address must be a tcp:// endpoint"
        );
        assert!(
            self.client_address.starts_with("tcp://"),
            "Client address must be a tcp:// endpoint"
        );
        assert!(self.poll_interval_ms > 0, "Poll interval is required");
        assert!(self.handler_pool_size > 0, "Handler pool must not be empty");
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
        self.scheduler.validate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let config = Config::load(None);
        config.validate();
        assert_eq!(config.scheduler.poll_interval_ms, 100);
        assert_eq!(config.scheduler.handler_pool_size, 100);
    }
}
