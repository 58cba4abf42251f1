// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML parameter loader.
//!
//! Every key is optional; missing keys keep the compiled-in default.
//!
//! # Example YAML
//!
//! ```yaml
//! # fabsd.yaml
//! max_outstanding: 32
//! retry:
//!   count: 5
//!   timeout_ms: 2000
//! busy_backoff_ms: 4000
//! receive_wait:
//!   min_ms: 1
//!   max_ms: 250
//! multicast:
//!   retry_delay_ms: 500
//!   maintenance_interval_ms: 5000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::SdParams;
use crate::error::{Result, SdError};

/// Root YAML document.
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct YamlParams {
    pub max_outstanding: Option<usize>,
    pub max_contexts: Option<usize>,
    pub max_response_bytes: Option<usize>,
    pub busy_backoff_ms: Option<u64>,
    pub retry: Option<YamlRetry>,
    pub receive_wait: Option<YamlReceiveWait>,
    pub multicast: Option<YamlMulticast>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct YamlRetry {
    pub count: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct YamlReceiveWait {
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct YamlMulticast {
    pub retry_delay_ms: Option<u64>,
    pub maintenance_interval_ms: Option<u64>,
}

impl YamlParams {
    /// Parse a YAML document.
    pub fn parse(yaml_content: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_content)
            .map_err(|e| SdError::Config(format!("Failed to parse YAML: {}", e)))
    }

    /// Overlay the document on `base`.
    #[must_use]
    pub fn apply(&self, mut base: SdParams) -> SdParams {
        if let Some(v) = self.max_outstanding {
            base.max_outstanding = v;
        }
        if let Some(v) = self.max_contexts {
            base.max_contexts = v;
        }
        if let Some(v) = self.max_response_bytes {
            base.max_response_bytes = v;
        }
        if let Some(v) = self.busy_backoff_ms {
            base.busy_backoff = Duration::from_millis(v);
        }
        if let Some(retry) = &self.retry {
            if let Some(count) = retry.count {
                base.default_policy.retry_count = count;
            }
            if let Some(ms) = retry.timeout_ms {
                base.default_policy.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(wait) = &self.receive_wait {
            if let Some(ms) = wait.min_ms {
                base.min_receive_wait = Duration::from_millis(ms);
            }
            if let Some(ms) = wait.max_ms {
                base.max_receive_wait = Duration::from_millis(ms);
            }
        }
        if let Some(mc) = &self.multicast {
            if let Some(ms) = mc.retry_delay_ms {
                base.mc_retry_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = mc.maintenance_interval_ms {
                base.mc_maintenance_interval = Duration::from_millis(ms);
            }
        }
        base
    }
}

impl SdParams {
    /// Defaults overlaid with a YAML document, then validated.
    pub fn from_yaml_str(yaml_content: &str) -> Result<Self> {
        let params = YamlParams::parse(yaml_content)?.apply(SdParams::new());
        params.validate()?;
        Ok(params)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SdError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        log::debug!("[CFG] loading parameters from {}", path.display());
        Self::from_yaml_str(&content)
    }
}
