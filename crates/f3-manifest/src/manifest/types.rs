//! Manifest Types
//!
//! Rust structs matching the F3 manifest JSON emitted by the node.
//! Field names are PascalCase and durations are integer nanoseconds.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ManifestDocument, PowerTableCid};
use crate::error::ManifestError;

/// F3 finality protocol manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub pause: bool,
    pub protocol_version: u64,
    pub initial_instance: u64,
    pub bootstrap_epoch: i64,
    pub network_name: String,
    #[serde(default)]
    pub explicit_power: Vec<PowerEntry>,
    #[serde(rename = "IgnoreECPower")]
    pub ignore_ec_power: bool,
    #[serde(default)]
    pub initial_power_table: Option<PowerTableCid>,
    pub committee_lookback: u64,
    #[serde(with = "duration_nanos")]
    pub catch_up_alignment: Duration,
    pub gpbft: GpbftConfig,
    #[serde(rename = "EC")]
    pub ec: EcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PowerEntry {
    #[serde(rename = "ID")]
    pub id: u64,
    pub power: u64,
    pub pub_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GpbftConfig {
    #[serde(with = "duration_nanos")]
    pub delta: Duration,
    pub delta_backoff_exponent: f64,
    pub quality_delta_multiplier: f64,
    pub max_lookahead_rounds: u64,
    #[serde(with = "duration_nanos")]
    pub rebroadcast_backoff_base: Duration,
    pub rebroadcast_backoff_exponent: f64,
    #[serde(with = "duration_nanos")]
    pub rebroadcast_backoff_max: Duration,
}

/// Expected-consensus parameters the finality gadget runs on top of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EcConfig {
    #[serde(with = "duration_nanos")]
    pub period: Duration,
    pub finality: i64,
    pub delay_multiplier: f64,
    pub base_decision_backoff_table: Vec<f64>,
    pub head_lookback: i64,
    pub finalize: bool,
}

impl Default for GpbftConfig {
    fn default() -> Self {
        Self {
            delta: Duration::from_secs(6),
            delta_backoff_exponent: 2.0,
            quality_delta_multiplier: 1.0,
            max_lookahead_rounds: 5,
            rebroadcast_backoff_base: Duration::from_secs(6),
            rebroadcast_backoff_exponent: 1.3,
            rebroadcast_backoff_max: Duration::from_secs(60),
        }
    }
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            finality: 900,
            delay_multiplier: 2.0,
            base_decision_backoff_table: vec![1.3, 1.69, 2.2, 2.86, 3.71, 4.83, 6.27, 7.5],
            head_lookback: 4,
            finalize: true,
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        let ec = EcConfig::default();
        Self {
            pause: false,
            protocol_version: 7,
            initial_instance: 0,
            bootstrap_epoch: 1000,
            network_name: "localnet".to_string(),
            explicit_power: Vec::new(),
            ignore_ec_power: false,
            initial_power_table: None,
            committee_lookback: 10,
            catch_up_alignment: ec.period / 2,
            gpbft: GpbftConfig::default(),
            ec,
        }
    }
}

impl Manifest {
    /// Validate manifest structure
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.network_name.is_empty() {
            return Err(ManifestError::EmptyNetworkName);
        }

        self.ec.validate()?;

        if self.catch_up_alignment > self.ec.period {
            return Err(ManifestError::CatchUpAlignmentTooLarge {
                alignment_ns: nanos(self.catch_up_alignment),
                period_ns: nanos(self.ec.period),
            });
        }

        if self.bootstrap_epoch < self.ec.finality {
            return Err(ManifestError::BootstrapBeforeFinality {
                bootstrap: self.bootstrap_epoch,
                finality: self.ec.finality,
            });
        }

        self.gpbft.validate()?;

        if self.ignore_ec_power && self.explicit_power.is_empty() {
            return Err(ManifestError::MissingExplicitPower);
        }

        let mut seen = HashSet::with_capacity(self.explicit_power.len());
        for entry in &self.explicit_power {
            if entry.power == 0 {
                return Err(ManifestError::ZeroPower(entry.id));
            }
            if !seen.insert(entry.id) {
                return Err(ManifestError::DuplicatePowerEntry(entry.id));
            }
        }

        if let Some(cid) = &self.initial_power_table {
            if !cid.is_well_formed() {
                return Err(ManifestError::MalformedPowerTableCid(cid.as_str().to_string()));
            }
        }

        Ok(())
    }
}

impl EcConfig {
    fn validate(&self) -> Result<(), ManifestError> {
        if self.period.is_zero() {
            return Err(ManifestError::ZeroEcPeriod);
        }
        if self.finality < 0 {
            return Err(ManifestError::NegativeFinality(self.finality));
        }
        if !(self.delay_multiplier > 0.0) {
            return Err(ManifestError::InvalidDelayMultiplier(self.delay_multiplier));
        }
        if self.base_decision_backoff_table.is_empty()
            || self.base_decision_backoff_table.iter().any(|b| !(*b > 0.0))
        {
            return Err(ManifestError::InvalidBackoffTable);
        }
        if self.head_lookback < 0 {
            return Err(ManifestError::NegativeHeadLookback(self.head_lookback));
        }
        Ok(())
    }
}

impl GpbftConfig {
    fn validate(&self) -> Result<(), ManifestError> {
        if self.delta.is_zero() {
            return Err(ManifestError::ZeroDelta);
        }
        if !(self.delta_backoff_exponent >= 1.0) {
            return Err(ManifestError::InvalidDeltaBackoffExponent(self.delta_backoff_exponent));
        }
        if !(self.quality_delta_multiplier >= 0.0) {
            return Err(ManifestError::InvalidQualityDeltaMultiplier(
                self.quality_delta_multiplier,
            ));
        }
        if self.rebroadcast_backoff_base.is_zero() {
            return Err(ManifestError::ZeroRebroadcastBackoffBase);
        }
        if !(self.rebroadcast_backoff_exponent >= 1.0) {
            return Err(ManifestError::InvalidRebroadcastBackoffExponent(
                self.rebroadcast_backoff_exponent,
            ));
        }
        if self.rebroadcast_backoff_max < self.rebroadcast_backoff_base {
            return Err(ManifestError::RebroadcastBackoffMaxBelowBase);
        }
        Ok(())
    }
}

impl ManifestDocument for Manifest {
    fn validate(&self) -> Result<(), ManifestError> {
        Manifest::validate(self)
    }

    fn equal(&self, other: Option<&Self>) -> bool {
        other.is_some_and(|other| self == other)
    }

    fn initial_power_table(&self) -> Option<&PowerTableCid> {
        self.initial_power_table.as_ref()
    }

    fn set_initial_power_table(&mut self, cid: PowerTableCid) {
        self.initial_power_table = Some(cid);
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Durations as integer nanoseconds
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::nanos(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
