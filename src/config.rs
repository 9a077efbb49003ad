//! Engine configuration: on-disk/heap layout knobs plus the normative
//! environment variables named in spec.md §6.
//!
//! Grounded on the teacher's `db::config`/admin `AdminOpenOptions` split:
//! a serde-serializable struct with `Default`, loadable from a TOML file,
//! with environment overrides applied on top (teacher pattern: CLI flags
//! and env vars both widen a struct built from `Default::default()`).

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VosError};

/// Write-ahead-log durability mode. Mirrors the teacher's `SyncMode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// `fsync` after every committed transaction.
    Full,
    /// `fsync` only at checkpoint boundaries.
    Checkpoint,
    /// Never force a sync (tests / throwaway pools only).
    Off,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Full
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk size in bytes (§3: fixed at 256 KiB in the reference format).
    pub chunk_size: u32,
    /// Maximum zone size in bytes (§3: ≤ 16 GiB).
    pub zone_size_cap: u64,
    /// Page cache capacity in chunks, for callers that layer a page cache
    /// over the heap (informational; the heap itself is mmap-backed).
    pub page_cache_capacity: usize,
    /// LRU array capacity for the VOS object cache (§4.H) — must be a
    /// power of two.
    pub object_cache_capacity: u32,
    /// LRU array sub-array count for the object cache — must be a power
    /// of two; `> 1` forces manual eviction per §4.C.
    pub object_cache_sub_arrays: u32,
    /// LRU array capacity for the DTX cache (§4.I).
    pub dtx_cache_capacity: u32,
    /// HLC synchronization epsilon (§4.A `recv`).
    pub hlc_epsilon: Duration,
    /// DTX batched-commit count threshold (§4.I, default 512).
    pub dtx_commit_count_threshold: usize,
    /// DTX batched-commit age threshold (§4.I, default 10s).
    pub dtx_commit_age_threshold: Duration,
    /// GC tight-mode credit budget (§4.J).
    pub gc_credits_tight: u32,
    /// GC slack-mode credit budget (§4.J).
    pub gc_credits_slack: u32,
    /// WAL durability mode.
    pub sync_mode: SyncMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            zone_size_cap: 16 * 1024 * 1024 * 1024,
            page_cache_capacity: 1024,
            object_cache_capacity: 4096,
            object_cache_sub_arrays: 1,
            dtx_cache_capacity: 4096,
            hlc_epsilon: Duration::from_secs(1),
            dtx_commit_count_threshold: 512,
            dtx_commit_age_threshold: Duration::from_secs(10),
            gc_credits_tight: 32,
            gc_credits_slack: 8,
            sync_mode: SyncMode::Full,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|err| VosError::InvalidArgument(format!("invalid engine config: {err}")))
    }

    /// Validates structural invariants that serde cannot express
    /// (power-of-two sizing per §4.C).
    pub fn validate(&self) -> Result<()> {
        if !self.object_cache_capacity.is_power_of_two() {
            return Err(VosError::InvalidArgument(
                "object_cache_capacity must be a power of two".into(),
            ));
        }
        if !self.object_cache_sub_arrays.is_power_of_two() {
            return Err(VosError::InvalidArgument(
                "object_cache_sub_arrays must be a power of two".into(),
            ));
        }
        if !self.dtx_cache_capacity.is_power_of_two() {
            return Err(VosError::InvalidArgument(
                "dtx_cache_capacity must be a power of two".into(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size as u64 > self.zone_size_cap {
            return Err(VosError::InvalidArgument(
                "chunk_size must be nonzero and fit within zone_size_cap".into(),
            ));
        }
        Ok(())
    }
}

/// Fabric-facing environment knobs named in spec.md §6.
///
/// This crate never opens a fabric connection (out of scope per §1), but
/// the local engine bootstrap still validates these the way the real
/// bootstrap would, since ambient configuration concerns are carried
/// regardless of which Non-goal excludes the transport itself.
#[derive(Clone, Debug, Default)]
pub struct FabricEnv {
    /// `CRT_TIMEOUT` — fabric operation timeout.
    pub crt_timeout: Option<Duration>,
    /// `D_INTERFACE` (preferred) / `OFI_INTERFACE` (deprecated alias).
    pub interface: Option<String>,
    /// `D_DOMAIN` (preferred) / `OFI_DOMAIN` (deprecated alias).
    pub domain: Option<String>,
    /// `D_PROVIDER`.
    pub provider: Option<String>,
    /// `FI_OFI_RXM_USE_SRX` — must match the server value.
    pub rxm_use_srx: Option<bool>,
    /// `CRT_SECONDARY_PROVIDER` — numeric index.
    pub secondary_provider: Option<u32>,
}

impl FabricEnv {
    /// Reads the normative environment variables from the process
    /// environment, preferring the non-deprecated name when both the
    /// preferred and the deprecated alias are set.
    pub fn from_process_env() -> Result<Self> {
        let crt_timeout = match env::var("CRT_TIMEOUT") {
            Ok(v) => Some(parse_secs(&v)?),
            Err(_) => None,
        };
        let interface = env::var("D_INTERFACE")
            .ok()
            .or_else(|| env::var("OFI_INTERFACE").ok());
        let domain = env::var("D_DOMAIN")
            .ok()
            .or_else(|| env::var("OFI_DOMAIN").ok());
        let provider = env::var("D_PROVIDER").ok();
        let rxm_use_srx = match env::var("FI_OFI_RXM_USE_SRX") {
            Ok(v) => Some(parse_bool(&v)?),
            Err(_) => None,
        };
        let secondary_provider = match env::var("CRT_SECONDARY_PROVIDER") {
            Ok(v) => Some(v.parse::<u32>().map_err(|_| {
                VosError::InvalidArgument("CRT_SECONDARY_PROVIDER must be numeric".into())
            })?),
            Err(_) => None,
        };
        Ok(Self {
            crt_timeout,
            interface,
            domain,
            provider,
            rxm_use_srx,
            secondary_provider,
        })
    }

    /// Validates the caller's SRX mode against the server's. Startup must
    /// be rejected on mismatch (§6).
    pub fn check_srx_compatibility(&self, server_rxm_use_srx: bool) -> Result<()> {
        match self.rxm_use_srx {
            Some(local) if local != server_rxm_use_srx => Err(VosError::AgentIncompatible(
                "FI_OFI_RXM_USE_SRX does not match server value".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn parse_secs(raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| VosError::InvalidArgument("CRT_TIMEOUT must be an integer seconds value".into()))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        _ => Err(VosError::InvalidArgument(
            "FI_OFI_RXM_USE_SRX must be a boolean-like value".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().expect("default is valid");
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let mut cfg = EngineConfig::default();
        cfg.object_cache_capacity = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_round_trip_overrides_fields() {
        let cfg = EngineConfig::from_toml_str("chunk_size = 131072\n").unwrap();
        assert_eq!(cfg.chunk_size, 131072);
        assert_eq!(cfg.zone_size_cap, EngineConfig::default().zone_size_cap);
    }

    #[test]
    fn srx_mismatch_rejected() {
        let env = FabricEnv {
            rxm_use_srx: Some(true),
            ..Default::default()
        };
        assert!(env.check_srx_compatibility(false).is_err());
        assert!(env.check_srx_compatibility(true).is_ok());
    }

    #[test]
    fn parse_bool_accepts_common_forms() {
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("no").unwrap());
        assert!(parse_bool("bogus").is_err());
    }
}
