use crate::classifier::{Matcher, ProviderRule, ProviderRuleset};
use anyhow::{Context, Result, bail};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use solana_commitment_config::CommitmentConfig;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

const ENV_PREFIX: &str = "NODE_ATLAS";
const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

#[derive(Debug, Parser)]
#[command(version, about = "Solana gossip node atlas")]
pub struct AppArgs {
    /// Path to a settings file (toml, yaml or json)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Collect a single snapshot, print its report as JSON and exit
    #[arg(long)]
    pub once: bool,

    /// Stop collecting after this many seconds
    #[arg(long)]
    pub run_for_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log filter directive, e.g. "info" or "node_atlas=debug"
    pub log: String,
    /// Prometheus listener; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
    pub rpc: RpcSettings,
    pub collector: CollectorSettings,
    pub aggregator: AggregatorSettings,
    pub storage: StorageSettings,
    pub geo: GeoSettings,
    /// Provider rules in priority order; the built-in set is used when empty
    pub providers: Vec<ProviderRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub url: String,
    /// "processed", "confirmed" or "finalized"
    pub commitment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Delay between the end of one cycle and the start of the next
    pub interval_secs: u64,
    /// Total attempts for the transaction scan
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    /// Most slots examined walking back from the current slot
    pub block_scan_limit: u64,
    /// Readable blocks after which the scan stops
    pub target_blocks: usize,
    /// Minimum balance change, in SOL, for a transfer to be reported
    pub threshold_sol: u64,
    pub top_transactions: usize,
    /// Gossip addresses in these ranges are dropped
    pub private_ranges: Vec<Matcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub trend_window: usize,
    pub top_transactions: usize,
    pub top_patterns: usize,
    /// Organizations listed per country
    pub top_organizations: usize,
    /// Reports buffered per observer before a slow observer starts skipping
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    /// CSV range table; every address resolves to "Unknown" when unset
    pub database_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: "info".to_string(),
            metrics_addr: None,
            rpc: RpcSettings::default(),
            collector: CollectorSettings::default(),
            aggregator: AggregatorSettings::default(),
            storage: StorageSettings::default(),
            geo: GeoSettings::default(),
            providers: Vec::new(),
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.to_string(),
            commitment: "confirmed".to_string(),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            block_scan_limit: 20,
            target_blocks: 5,
            threshold_sol: 100,
            top_transactions: 10,
            private_ranges: ["10.0.0.0/8", "127.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
                .into_iter()
                .filter_map(|range| Matcher::try_from(range.to_string()).ok())
                .collect(),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            trend_window: 20,
            top_transactions: 10,
            top_patterns: 10,
            top_organizations: 5,
            broadcast_capacity: 16,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./data/solana_data.json"),
        }
    }
}

impl CollectorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn threshold_lamports(&self) -> u64 {
        self.threshold_sol
            .saturating_mul(crate::types::LAMPORTS_PER_SOL)
    }
}

impl RpcSettings {
    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.url).with_context(|| format!("Invalid RPC URL `{}`", self.url))
    }

    pub fn commitment(&self) -> CommitmentConfig {
        match self.commitment.as_str() {
            "processed" => CommitmentConfig::processed(),
            "finalized" => CommitmentConfig::finalized(),
            _ => CommitmentConfig::confirmed(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional file, with `NODE_ATLAS__*` environment
    /// variables taking priority (e.g. `NODE_ATLAS__COLLECTOR__INTERVAL_SECS`).
    pub fn new(path: Option<&Path>) -> Result<Self> {
        // NOTE: It's ok if this fails (file might not exist)
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.rpc.url()?.scheme(), "http" | "https") {
            bail!("RPC URL must start with http:// or https://");
        }
        if !matches!(
            self.rpc.commitment.as_str(),
            "processed" | "confirmed" | "finalized"
        ) {
            bail!("Unknown RPC commitment `{}`", self.rpc.commitment);
        }

        let collector = &self.collector;
        if collector.interval_secs == 0 {
            bail!("Collector interval_secs must be greater than 0");
        }
        if collector.retry_attempts == 0 {
            bail!("Collector retry_attempts must be at least 1");
        }
        if collector.block_scan_limit == 0 || collector.target_blocks == 0 {
            bail!("Collector block_scan_limit and target_blocks must be greater than 0");
        }
        if collector.top_transactions == 0 {
            bail!("Collector top_transactions must be greater than 0");
        }

        let aggregator = &self.aggregator;
        if aggregator.trend_window == 0 {
            bail!("Aggregator trend_window must be greater than 0");
        }
        if aggregator.top_transactions == 0
            || aggregator.top_patterns == 0
            || aggregator.top_organizations == 0
        {
            bail!(
                "Aggregator top_transactions, top_patterns and top_organizations must be greater than 0"
            );
        }
        if aggregator.broadcast_capacity == 0 {
            bail!("Aggregator broadcast_capacity must be greater than 0");
        }

        for rule in &self.providers {
            if rule.provider.trim().is_empty() {
                bail!("Provider rules need a provider label");
            }
            if rule.matchers.is_empty() {
                bail!("Provider rule `{}` has no matchers", rule.provider);
            }
        }

        if let Some(path) = &self.geo.database_path
            && !path.exists()
        {
            bail!("Geo database {path:?} does not exist");
        }

        Ok(())
    }

    pub fn ruleset(&self) -> ProviderRuleset {
        if self.providers.is_empty() {
            ProviderRuleset::default()
        } else {
            ProviderRuleset::new(self.providers.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.collector.retry_attempts, 3);
        assert_eq!(settings.collector.retry_delay(), Duration::from_millis(1000));
        assert_eq!(settings.collector.threshold_lamports(), 100_000_000_000);
        assert_eq!(settings.aggregator.trend_window, 20);
        assert_eq!(settings.aggregator.top_organizations, 5);
        assert_eq!(settings.ruleset(), ProviderRuleset::default());
        assert_eq!(settings.collector.private_ranges.len(), 4);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.collector.retry_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.aggregator.trend_window = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.aggregator.top_organizations = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.rpc.commitment = "eventually".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.rpc.url = "ws://localhost:8900".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.rpc.url = "not a url".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.providers = vec![ProviderRule::new("Empty", &[])];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
log = "debug"

[rpc]
url = "http://127.0.0.1:8899"
commitment = "finalized"

[collector]
interval_secs = 5
retry_attempts = 2
private_ranges = ["10.0.0.0/8"]

[aggregator]
trend_window = 8

[[providers]]
provider = "Example Cloud"
matchers = ["52.", "100.64.0.0/10"]
exclusions = ["52.1."]
"#
        )
        .unwrap();

        let settings = Settings::new(Some(file.path())).unwrap();
        assert_eq!(settings.log, "debug");
        assert_eq!(settings.rpc.url().unwrap().as_str(), "http://127.0.0.1:8899/");
        assert_eq!(settings.rpc.commitment(), CommitmentConfig::finalized());
        assert_eq!(settings.collector.interval(), Duration::from_secs(5));
        assert_eq!(settings.collector.retry_attempts, 2);
        // Unset fields keep their defaults
        assert_eq!(settings.collector.block_scan_limit, 20);
        assert_eq!(settings.collector.private_ranges.len(), 1);
        assert_eq!(settings.aggregator.trend_window, 8);

        let ruleset = settings.ruleset();
        assert_eq!(ruleset.rules().len(), 1);
        assert_eq!(ruleset.rules()[0].provider, "Example Cloud");
        assert_eq!(ruleset.rules()[0].exclusions.len(), 1);
    }

    #[test]
    fn test_invalid_matcher_in_file_fails() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[providers]]
provider = "Broken"
matchers = ["10.0.0.0/40"]
"#
        )
        .unwrap();

        assert!(Settings::new(Some(file.path())).is_err());
    }
}
