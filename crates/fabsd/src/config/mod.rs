// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subnet driver configuration - single source of truth.
//!
//! All protocol constants live here. **Never hardcode them elsewhere.**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time defaults (`pub const` below)
//! - **Level 2 (Dynamic)**: [`SdParams`], built in code, from environment
//!   variables or from YAML (`config-loaders` feature), published at runtime
//!   through [`RuntimeConfig`]
//!
//! # Example
//!
//! ```ignore
//! use fabsd::config::{RuntimeConfig, SdParams};
//!
//! let mut params = SdParams::from_env()?;
//! params.max_outstanding = 16;
//! let config = RuntimeConfig::new(params)?;
//! assert_eq!(config.params().max_outstanding, 16);
//! ```

mod runtime;
#[cfg(feature = "config-loaders")]
mod yaml;

pub use runtime::RuntimeConfig;
#[cfg(feature = "config-loaders")]
pub use yaml::YamlParams;

use std::time::Duration;

use crate::error::{Result, SdError};
use crate::types::RetryPolicy;

// =======================================================================
// Retry policy defaults
// =======================================================================

/// Re-sends after the first attempt before a request is failed.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Per-attempt response timeout (ms).
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 10_000;

/// Delay before a request answered with BUSY is sent again (ms).
pub const BUSY_BACKOFF_MS: u64 = 10_000;

// =======================================================================
// Backpressure & table sizing
// =======================================================================

/// Maximum transactions on the wire at once, across every client.
pub const DEFAULT_MAX_OUTSTANDING: usize = 64;

/// Capacity of the transaction table (pending + completed + in use).
pub const MAX_CONTEXTS: usize = 4096;

/// Transaction ids occupy the upper 56 bits; the low byte belongs to the
/// transport.
pub const TID_SHIFT: u32 = 8;

/// Width of the transaction id counter.
pub const TID_SPACE_BITS: u32 = 56;

// =======================================================================
// Management addressing
// =======================================================================

/// Well-known queue pair of the subnet administrator.
pub const GSI_QP: u32 = 1;

/// Well-known Q_Key of the general services interface.
pub const GSI_QKEY: u32 = 0x8001_0000;

/// Encoded size of a class-port-info attribute.
pub const CLASS_PORT_INFO_LEN: usize = 72;

// =======================================================================
// Receive loop
// =======================================================================

/// Upper clamp on a blocking receive (ms). Also the aging period when idle.
pub const MAX_RECEIVE_WAIT_MS: u64 = 500;

/// Lower clamp on a blocking receive (ms), avoids busy-spinning on deadlines
/// that have just passed.
pub const MIN_RECEIVE_WAIT_MS: u64 = 1;

// =======================================================================
// Multi-part responses
// =======================================================================

/// Payload bytes carried by one segment of a multi-part reply.
pub const SEGMENT_PAYLOAD_SIZE: usize = 220;

/// Largest reassembled response accepted before the transaction is failed.
pub const MAX_RESPONSE_BYTES: usize = 256 * 1024;

// =======================================================================
// Multicast membership
// =======================================================================

/// Delay between scheduling and issuing a group join/leave (ms). Also the
/// re-issue delay after a timeout or BUSY answer.
pub const MC_RETRY_DELAY_MS: u64 = 1_000;

/// Period of the sweep that frees deleted groups and clients (ms).
pub const MC_MAINTENANCE_INTERVAL_MS: u64 = 5_000;

// =======================================================================
// Environment overrides
// =======================================================================

pub const ENV_MAX_OUTSTANDING: &str = "FABSD_MAX_OUTSTANDING";
pub const ENV_RETRY_COUNT: &str = "FABSD_RETRY_COUNT";
pub const ENV_RETRY_TIMEOUT_MS: &str = "FABSD_RETRY_TIMEOUT_MS";
pub const ENV_BUSY_BACKOFF_MS: &str = "FABSD_BUSY_BACKOFF_MS";

// =======================================================================
// Tunables
// =======================================================================

/// Tunable driver parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdParams {
    /// Ceiling on in-flight transactions.
    pub max_outstanding: usize,
    /// Policy given to clients that register without one.
    pub default_policy: RetryPolicy,
    pub busy_backoff: Duration,
    pub min_receive_wait: Duration,
    pub max_receive_wait: Duration,
    pub max_contexts: usize,
    pub max_response_bytes: usize,
    pub mc_retry_delay: Duration,
    pub mc_maintenance_interval: Duration,
}

impl SdParams {
    /// Compile-time defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            default_policy: RetryPolicy::default(),
            busy_backoff: Duration::from_millis(BUSY_BACKOFF_MS),
            min_receive_wait: Duration::from_millis(MIN_RECEIVE_WAIT_MS),
            max_receive_wait: Duration::from_millis(MAX_RECEIVE_WAIT_MS),
            max_contexts: MAX_CONTEXTS,
            max_response_bytes: MAX_RESPONSE_BYTES,
            mc_retry_delay: Duration::from_millis(MC_RETRY_DELAY_MS),
            mc_maintenance_interval: Duration::from_millis(MC_MAINTENANCE_INTERVAL_MS),
        }
    }

    /// Defaults with `FABSD_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut params = Self::new();
        params.apply_env(|key| std::env::var(key).ok())?;
        Ok(params)
    }

    /// Apply overrides from a key lookup (environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_OUTSTANDING) {
            self.max_outstanding = parse_env(ENV_MAX_OUTSTANDING, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_COUNT) {
            self.default_policy.retry_count = parse_env(ENV_RETRY_COUNT, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_TIMEOUT_MS) {
            self.default_policy.timeout =
                Duration::from_millis(parse_env(ENV_RETRY_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_BUSY_BACKOFF_MS) {
            self.busy_backoff = Duration::from_millis(parse_env(ENV_BUSY_BACKOFF_MS, &v)?);
        }
        Ok(())
    }

    /// Reject parameter sets the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding == 0 {
            return Err(SdError::Config("max_outstanding must be at least 1".into()));
        }
        if self.max_contexts == 0 {
            return Err(SdError::Config("max_contexts must be at least 1".into()));
        }
        if self.default_policy.timeout.is_zero() {
            return Err(SdError::Config("default retry timeout must be non-zero".into()));
        }
        if self.min_receive_wait > self.max_receive_wait {
            return Err(SdError::Config(format!(
                "min_receive_wait {:?} exceeds max_receive_wait {:?}",
                self.min_receive_wait, self.max_receive_wait
            )));
        }
        if self.max_response_bytes < SEGMENT_PAYLOAD_SIZE {
            return Err(SdError::Config(
                "max_response_bytes smaller than one segment".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a computed wait into `[min_receive_wait, max_receive_wait]`.
    #[must_use]
    pub fn clamp_wait(&self, wait: Duration) -> Duration {
        wait.clamp(self.min_receive_wait, self.max_receive_wait)
    }
}

impl Default for SdParams {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SdError::Config(format!("{}: cannot parse '{}'", key, value)))
}
