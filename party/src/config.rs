use std::{collections::HashSet, env, fs, net::SocketAddr, time::Duration};

use comms::{PartyRole, Timeouts};
use secure_nn::ArchSpec;
use serde::{Deserialize, Serialize};

use crate::{PartyErr, Result, data::DataConfig};

/// Path of the JSON configuration file.
pub const CONFIG_ENV: &str = "PARTY_CONFIG";
/// Overrides the configured role, so three processes can share one file.
pub const ROLE_ENV: &str = "PARTY_ROLE";

/// Everything a party process needs, identical on every role except `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartyConfig {
    pub role: PartyRole,
    /// The listening address of every role, indexed by role id.
    pub peers: [SocketAddr; PartyRole::COUNT],
    pub arch: ArchSpec,
    /// Seed of the public model weights, must match across roles.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    pub data: DataConfig,
}

/// Execution bounds of the training loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Executed batches per epoch, all of them when absent.
    pub max_batches: Option<usize>,
    /// Runs the plaintext reference alongside and logs the difference.
    pub compare: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            max_batches: None,
            compare: false,
        }
    }
}

/// Wait bounds in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub barrier_ms: u64,
    pub exchange_ms: u64,
    pub connect_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            barrier_ms: defaults.barrier.as_millis() as u64,
            exchange_ms: defaults.exchange.as_millis() as u64,
            connect_ms: defaults.connect.as_millis() as u64,
        }
    }
}

impl From<&TimeoutsConfig> for Timeouts {
    fn from(value: &TimeoutsConfig) -> Self {
        Timeouts {
            barrier: Duration::from_millis(value.barrier_ms),
            exchange: Duration::from_millis(value.exchange_ms),
            connect: Duration::from_millis(value.connect_ms),
        }
    }
}

impl PartyConfig {
    /// Loads the configuration named by `PARTY_CONFIG`, applying `PARTY_ROLE` if set.
    ///
    /// # Returns
    /// A validated configuration.
    pub fn from_env() -> Result<Self> {
        let path = env::var(CONFIG_ENV)
            .map_err(|e| PartyErr::Config(format!("{CONFIG_ENV}: {e}")))?;
        let json = fs::read_to_string(&path)?;

        let role = match env::var(ROLE_ENV) {
            Ok(role) => Some(parse_role(&role)?),
            Err(env::VarError::NotPresent) => None,
            Err(e) => return Err(PartyErr::Config(format!("{ROLE_ENV}: {e}"))),
        };

        Self::from_json(&json, role)
    }

    /// Parses and validates a configuration.
    ///
    /// # Arguments
    /// * `json` - The configuration document.
    /// * `role` - Overrides the role of the document.
    ///
    /// # Returns
    /// A validated configuration.
    pub fn from_json(json: &str, role: Option<PartyRole>) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        if let Some(role) = role {
            config.role = role;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would fail only after connecting.
    pub fn validate(&self) -> Result<()> {
        if self.training.epochs == 0 {
            return Err(PartyErr::Config("epochs must be positive".into()));
        }

        if self.training.max_batches == Some(0) {
            return Err(PartyErr::Config("max_batches must be positive".into()));
        }

        let distinct: HashSet<_> = self.peers.iter().collect();
        if distinct.len() != self.peers.len() {
            return Err(PartyErr::Config("every role needs its own address".into()));
        }

        let t = &self.timeouts;
        if t.barrier_ms == 0 || t.exchange_ms == 0 || t.connect_ms == 0 {
            return Err(PartyErr::Config("timeouts must be positive".into()));
        }

        self.data.validate()?;
        self.arch.build()?;
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from(&self.timeouts)
    }
}

fn parse_role(s: &str) -> Result<PartyRole> {
    s.trim()
        .parse::<usize>()
        .ok()
        .and_then(PartyRole::from_id)
        .ok_or_else(|| PartyErr::Config(format!("{ROLE_ENV} must be 0, 1 or 2, got {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "role": 1,
        "peers": ["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"],
        "arch": { "topology": { "name": "minionn", "overrides": { "batch_size": 4 } } },
        "seed": 9,
        "training": { "epochs": 2, "compare": true },
        "data": { "synthetic": { "samples": 10, "seed": 3 } }
    }"#;

    #[test]
    fn config_parses_with_defaults() {
        let config = PartyConfig::from_json(JSON, None).unwrap();

        assert_eq!(config.role, PartyRole::Role1);
        assert_eq!(config.seed, 9);
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.max_batches, None);
        assert_eq!(config.timeouts(), Timeouts::default());
        assert_eq!(config.arch.build().unwrap().batch_size(), Some(4));
    }

    #[test]
    fn role_can_be_overridden() {
        let config = PartyConfig::from_json(JSON, Some(PartyRole::Role2)).unwrap();
        assert_eq!(config.role, PartyRole::Role2);

        assert_eq!(parse_role(" 0 ").unwrap(), PartyRole::Role0);
        assert!(parse_role("3").is_err());
        assert!(parse_role("helper").is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let zero_epochs = JSON.replace(r#""epochs": 2"#, r#""epochs": 0"#);
        assert!(matches!(
            PartyConfig::from_json(&zero_epochs, None),
            Err(PartyErr::Config(_))
        ));

        let shared_addr = JSON.replace("127.0.0.1:7002", "127.0.0.1:7001");
        assert!(PartyConfig::from_json(&shared_addr, None).is_err());

        let bad_arch = JSON.replace(r#""batch_size": 4"#, r#""widths": [4]"#);
        assert!(matches!(
            PartyConfig::from_json(&bad_arch, None),
            Err(PartyErr::Nn(_))
        ));

        let unknown = JSON.replace(r#""seed": 9"#, r#""sed": 9"#);
        assert!(PartyConfig::from_json(&unknown, None).is_err());
    }
}
