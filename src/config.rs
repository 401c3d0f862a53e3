//! Node configuration

use crate::{
    message::{NodeId, Peer},
    RATE,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{error::Error, path::Path, time::Duration};

/// What to do when the reply deadline passes with voters still silent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Withdraw the request and report the silent peers to the caller.
    #[default]
    Abort,
    /// Drop the silent peers from this cycle's voters and enter anyway.
    ExcludeSilent,
}

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff in milliseconds
    pub initial_ms: u64,
    /// Maximum backoff in milliseconds
    pub max_ms: u64,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Backoff duration for a given retry count, with 50% to 150% jitter.
    ///
    /// Falls back to `max_ms` when the settings produce no valid duration.
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let max = Duration::from_millis(self.max_ms);
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let base =
            Duration::from_millis(self.initial_ms).as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(max.as_secs_f64());
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::try_from_secs_f64(capped * jitter_factor).unwrap_or(max)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.) {
            return Err(format!(
                "backoff multiplier must be finite and at least 1, got {}",
                self.multiplier
            )
            .into());
        }
        if self.initial_ms > self.max_ms {
            return Err(format!(
                "backoff initial_ms {} exceeds max_ms {}",
                self.initial_ms, self.max_ms
            )
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique identity of this node; also the tie-break key.
    pub id: NodeId,
    /// Address the node listens on for protocol traffic.
    pub address: String,
    /// Discovery registry to announce to, if any.
    pub registry_address: Option<String>,
    /// Peers known up front.
    pub peers: Vec<Peer>,
    /// How long `request_entry` waits for the reply threshold.
    pub reply_timeout_ms: u64,
    /// Per-message timeout of the TCP transport.
    pub send_timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    /// Mean number of critical-section attempts per second.
    pub rate: f64,
    /// Seed of the re-entry scheduler and backoff jitter.
    pub seed: u64,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: "node".to_string(),
            address: "127.0.0.1:7000".to_string(),
            registry_address: None,
            peers: Vec::new(),
            reply_timeout_ms: 5_000,
            send_timeout_ms: 1_000,
            timeout_policy: TimeoutPolicy::Abort,
            rate: RATE,
            seed: 0,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(config: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let config = serde_json::from_str::<Self>(config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Rejects configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.id.is_empty() {
            return Err("node id must not be empty".into());
        }
        if self.peers.iter().any(|peer| peer.id == self.id) {
            return Err(format!("node id {} is also listed as a peer", self.id).into());
        }
        if !(self.rate.is_finite() && self.rate > 0.) {
            return Err(format!("rate must be positive, got {}", self.rate).into());
        }
        self.backoff.validate()
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.id.clone(), self.address.clone())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn missing_fields_take_defaults() {
        let config = Config::from_json_str(
            r#"{"id": "a", "address": "127.0.0.1:7001", "timeout_policy": "exclude_silent"}"#,
        )
        .unwrap();

        assert_eq!(config.id, "a");
        assert_eq!(config.timeout_policy, TimeoutPolicy::ExcludeSilent);
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let err = Config::from_json_str(
            r#"{"id": "a", "peers": [{"id": "a", "address": "127.0.0.1:7002"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("also listed"));
    }

    #[test]
    fn broken_backoff_is_rejected() {
        for backoff in [
            r#"{"multiplier": -2.0}"#,
            r#"{"multiplier": 0.5}"#,
            r#"{"initial_ms": 500, "max_ms": 100}"#,
        ] {
            let json = format!(r#"{{"id": "a", "backoff": {backoff}}}"#);
            let err = Config::from_json_str(&json).unwrap_err();
            assert!(err.to_string().contains("backoff"), "{backoff}: {err}");
        }
    }

    #[test]
    fn unvalidated_backoff_never_panics() {
        let mut rng = StdRng::seed_from_u64(3);

        for multiplier in [-2.0, f64::NAN, f64::INFINITY] {
            let backoff = BackoffConfig {
                initial_ms: 10,
                max_ms: 100,
                multiplier,
            };
            for retries in 0..4 {
                assert!(backoff.duration(retries, &mut rng) <= Duration::from_millis(150));
            }
        }
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = BackoffConfig {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
        };
        let mut rng = StdRng::seed_from_u64(7);

        for retries in 0..20 {
            let delay = backoff.duration(retries, &mut rng);
            assert!(delay <= Duration::from_millis(151));
            assert!(delay >= Duration::from_millis(4));
        }
    }
}
