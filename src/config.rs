//! Environment configuration
//!
//! Everything comes from environment variables (a `.env` file is honored
//! when present). Networks are declared with a count variable plus an
//! indexed prefix:
//!
//! ```text
//! NETWORKS_COUNT=2
//! NETWORK_0_SYSTEM_ID=1
//! NETWORK_0_KIND=evm
//! NETWORK_0_RPC_URL=http://localhost:8545
//! NETWORK_0_CONTRACT_ADDRESS=0x...
//! NETWORK_1_SYSTEM_ID=5
//! NETWORK_1_KIND=corda
//! NETWORK_1_CONTRACT_ADDRESS=O=PartyA,L=London,C=GB
//! NETWORK_1_AUTH_SYSTEM_ID=1
//! NETWORK_1_AUTH_CONTRACT_ADDRESS=0x...
//! ```

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;

use crate::types::LedgerKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub networks: Vec<NetworkConfig>,
    /// Network newly submitted instructions default to.
    pub local_system_id: u64,
    pub decoder_url: String,
    pub evm_private_key: SecretKey,
    pub callbacks: CallbackConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Signing key wrapper so Debug output never leaks it.
#[derive(Clone)]
pub struct SecretKey(pub String);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub system_id: u64,
    pub kind: LedgerKind,
    /// Required for EVM networks, unused for Corda (reached via the decoder).
    pub rpc_url: Option<String>,
    /// Interop contract address for EVM, X.500 party locator for Corda.
    pub contract_address: String,
    /// Hidden-auth parameters a Corda network relays alongside decoder calls.
    pub auth_system_id: Option<u64>,
    pub auth_contract_address: Option<String>,
    pub scan_window: u64,
}

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Rewrite https callback URLs to http (test environments without TLS).
    pub rewrite_https: bool,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// Wall-clock budget per ledger-waiting state, seconds.
    pub state_budget_secs: u64,
    pub communication_budget_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    /// How long a blocking submission waits for a terminal state, seconds.
    pub sync_wait_secs: u64,
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_state_budget() -> u64 {
    300
}

fn default_communication_budget() -> u64 {
    300
}

fn default_scan_window() -> u64 {
    1000
}

fn default_sync_wait() -> u64 {
    60
}

fn default_api_port() -> u16 {
    8080
}

fn optional_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{name} environment variable is required"))
}

impl Config {
    /// Load a `.env` file if present, then read from the environment.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::dotenv().wrap_err("failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required_env("DATABASE_URL")?,
        };

        let count: usize = required_env("NETWORKS_COUNT")?
            .parse()
            .wrap_err("NETWORKS_COUNT must be a number")?;
        let mut networks = Vec::with_capacity(count);
        for i in 0..count {
            networks.push(load_network(i)?);
        }

        let config = Config {
            database,
            networks,
            local_system_id: required_env("LOCAL_SYSTEM_ID")?
                .parse()
                .wrap_err("LOCAL_SYSTEM_ID must be a u64")?,
            decoder_url: required_env("DECODER_URL")?,
            evm_private_key: SecretKey(required_env("EVM_PRIVATE_KEY")?),
            callbacks: CallbackConfig {
                rewrite_https: optional_env("CALLBACK_REWRITE_HTTPS").unwrap_or(false),
                bearer_token: env::var("CALLBACK_BEARER_TOKEN").ok(),
            },
            scheduler: SchedulerConfig {
                poll_interval_ms: optional_env("POLL_INTERVAL_MS")
                    .unwrap_or_else(default_poll_interval),
                state_budget_secs: optional_env("STATE_BUDGET_SECS")
                    .unwrap_or_else(default_state_budget),
                communication_budget_secs: optional_env("COMMUNICATION_BUDGET_SECS")
                    .unwrap_or_else(default_communication_budget),
            },
            api: ApiConfig {
                bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".into()),
                port: optional_env("API_PORT").unwrap_or_else(default_api_port),
                sync_wait_secs: optional_env("SYNC_WAIT_SECS").unwrap_or_else(default_sync_wait),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn network(&self, system_id: u64) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.system_id == system_id)
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("DATABASE_URL cannot be empty"));
        }
        if self.networks.is_empty() {
            return Err(eyre!("at least one network must be configured"));
        }

        let key = &self.evm_private_key.0;
        if key.len() != 66 || !key.starts_with("0x") {
            return Err(eyre!("EVM_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"));
        }

        for network in &self.networks {
            // two connectors on one system id would race on the same records
            let occurrences = self
                .networks
                .iter()
                .filter(|n| n.system_id == network.system_id)
                .count();
            if occurrences > 1 {
                return Err(eyre!(
                    "network {} is configured more than once",
                    network.system_id
                ));
            }

            match network.kind {
                LedgerKind::Evm => {
                    if network.rpc_url.as_deref().unwrap_or("").is_empty() {
                        return Err(eyre!(
                            "network {} is EVM and needs an RPC URL",
                            network.system_id
                        ));
                    }
                    if network.contract_address.len() != 42
                        || !network.contract_address.starts_with("0x")
                    {
                        return Err(eyre!(
                            "network {} contract address must be a 42-char 0x hex address",
                            network.system_id
                        ));
                    }
                }
                LedgerKind::Corda => {
                    if network.contract_address.is_empty() {
                        return Err(eyre!(
                            "network {} is Corda and needs a party locator",
                            network.system_id
                        ));
                    }
                    if network.auth_system_id.is_none()
                        || network.auth_contract_address.as_deref().unwrap_or("").is_empty()
                    {
                        return Err(eyre!(
                            "network {} is Corda and needs auth parameters for the decoder",
                            network.system_id
                        ));
                    }
                }
            }
        }

        if self.network(self.local_system_id).is_none() {
            return Err(eyre!(
                "LOCAL_SYSTEM_ID {} is not among the configured networks",
                self.local_system_id
            ));
        }
        if self.decoder_url.is_empty() {
            return Err(eyre!("DECODER_URL cannot be empty"));
        }
        Ok(())
    }
}

fn load_network(index: usize) -> Result<NetworkConfig> {
    let var = |suffix: &str| format!("NETWORK_{index}_{suffix}");
    let kind: LedgerKind = required_env(&var("KIND"))?
        .parse()
        .map_err(|e: String| eyre!("{}: {e}", var("KIND")))?;
    Ok(NetworkConfig {
        system_id: required_env(&var("SYSTEM_ID"))?
            .parse()
            .wrap_err_with(|| format!("{} must be a u64", var("SYSTEM_ID")))?,
        kind,
        rpc_url: env::var(var("RPC_URL")).ok(),
        contract_address: required_env(&var("CONTRACT_ADDRESS"))?,
        auth_system_id: optional_env(&var("AUTH_SYSTEM_ID")),
        auth_contract_address: env::var(var("AUTH_CONTRACT_ADDRESS")).ok(),
        scan_window: optional_env(&var("SCAN_WINDOW")).unwrap_or_else(default_scan_window),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm_network(system_id: u64) -> NetworkConfig {
        NetworkConfig {
            system_id,
            kind: LedgerKind::Evm,
            rpc_url: Some("http://localhost:8545".into()),
            contract_address: "0x0000000000000000000000000000000000000001".into(),
            auth_system_id: None,
            auth_contract_address: None,
            scan_window: default_scan_window(),
        }
    }

    fn corda_network(system_id: u64) -> NetworkConfig {
        NetworkConfig {
            system_id,
            kind: LedgerKind::Corda,
            rpc_url: None,
            contract_address: "O=PartyA,L=London,C=GB".into(),
            auth_system_id: Some(1),
            auth_contract_address: Some("0x0000000000000000000000000000000000000002".into()),
            scan_window: default_scan_window(),
        }
    }

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/orchestrator".into(),
            },
            networks: vec![evm_network(1), corda_network(5)],
            local_system_id: 1,
            decoder_url: "http://localhost:3030".into(),
            evm_private_key: SecretKey(format!("0x{}", "ab".repeat(32))),
            callbacks: CallbackConfig {
                rewrite_https: false,
                bearer_token: None,
            },
            scheduler: SchedulerConfig {
                poll_interval_ms: default_poll_interval(),
                state_budget_secs: default_state_budget(),
                communication_budget_secs: default_communication_budget(),
            },
            api: ApiConfig {
                bind_address: "0.0.0.0".into(),
                port: default_api_port(),
                sync_wait_secs: default_sync_wait(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_poll_interval(), 5000);
        assert_eq!(default_state_budget(), 300);
        assert_eq!(default_communication_budget(), 300);
        assert_eq!(default_sync_wait(), 60);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_duplicate_system_id_rejected() {
        let mut config = valid_config();
        config.networks.push(evm_network(1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_bad_private_key_rejected() {
        let mut config = valid_config();
        config.evm_private_key = SecretKey("0x123".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_evm_network_needs_rpc_url() {
        let mut config = valid_config();
        config.networks[0].rpc_url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_corda_network_needs_auth() {
        let mut config = valid_config();
        config.networks[1].auth_system_id = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_system_must_be_configured() {
        let mut config = valid_config();
        config.local_system_id = 42;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let config = valid_config();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("postgres://"));
        assert!(!rendered.contains("abababab"));
    }
}
