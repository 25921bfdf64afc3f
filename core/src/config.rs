use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub endpoints: EndpointsConfig,
    pub extract: ExtractConfig,
    pub chain: ChainConfig,
    pub telemetry: TelemetryConfig,
}

/// Base URLs of the subgraphs streams are pulled from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointsConfig {
    pub ice_api_url: String,
    pub quickswap_api_url: String,
    pub marketplace_api_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractConfig {
    /// Replication start used when no bookmark exists for a stream.
    pub start_updated_at: Option<i64>,
    pub user_agent: Option<String>,
    pub request_timeout_secs: u64,
    /// Overrides the first retry delay of every retry policy.
    pub retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Wallet whose incoming transfers count as secondary revenue.
    pub treasury_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Defaults, then `config.toml` (or the given file), then `EXTRACTOR__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new("config.toml").exists() => {
                builder = builder.add_source(File::with_name("config"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("EXTRACTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let urls = [
            ("endpoints.ice_api_url", &self.endpoints.ice_api_url),
            ("endpoints.quickswap_api_url", &self.endpoints.quickswap_api_url),
            ("endpoints.marketplace_api_url", &self.endpoints.marketplace_api_url),
            ("chain.rpc_url", &self.chain.rpc_url),
        ];
        for (name, url) in urls {
            if url.is_empty() {
                return Err(ConfigError::Message(format!("{name} is required")));
            }
        }

        let treasury = self.chain.treasury_address.trim_start_matches("0x");
        if treasury.len() != 40 || !treasury.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Message(
                "chain.treasury_address must be a 20-byte hex address".into(),
            ));
        }

        if self.extract.request_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "extract.request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: EndpointsConfig {
                ice_api_url:
                    "https://api.thegraph.com/subgraphs/name/satoshi-naoki/decentralgamesice"
                        .to_string(),
                quickswap_api_url:
                    "https://api.thegraph.com/subgraphs/name/sameepsi/quickswap06".to_string(),
                marketplace_api_url:
                    "https://api.thegraph.com/subgraphs/name/decentraland/marketplace-matic"
                        .to_string(),
            },
            extract: ExtractConfig {
                start_updated_at: Some(1),
                user_agent: None,
                request_timeout_secs: 300,
                retry_base_delay_ms: None,
            },
            chain: ChainConfig {
                rpc_url: "https://polygon-rpc.com/".to_string(),
                treasury_address: "0x7a61a0ed364e599ae4748d1ebe74bf236dd27b09".to_string(),
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: false,
                metrics_port: 9090,
            },
        }
    }
}
