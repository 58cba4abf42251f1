// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime-swappable parameter snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::SdParams;
use crate::error::Result;

/// Current driver parameters, published lock-free.
///
/// Readers take a snapshot with [`RuntimeConfig::params`] and keep using it
/// for the whole operation; writers replace the snapshot atomically. A change
/// of ceiling or receive clamps takes effect on the next send/aging pass.
#[derive(Debug)]
pub struct RuntimeConfig {
    params: ArcSwap<SdParams>,
}

impl RuntimeConfig {
    /// Validate and publish an initial parameter set.
    pub fn new(params: SdParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params: ArcSwap::from_pointee(params),
        })
    }

    /// Snapshot of the current parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> Arc<SdParams> {
        self.params.load_full()
    }

    /// Replace the parameters. The old snapshot stays valid for readers
    /// that already hold it.
    pub fn update(&self, params: SdParams) -> Result<()> {
        params.validate()?;
        log::info!(
            "[CFG] params updated max_outstanding={} retry_count={} timeout={:?}",
            params.max_outstanding,
            params.default_policy.retry_count,
            params.default_policy.timeout
        );
        self.params.store(Arc::new(params));
        Ok(())
    }

    /// Read-modify-write helper for single-field changes.
    pub fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SdParams),
    {
        let mut next = (*self.params()).clone();
        f(&mut next);
        self.update(next)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            params: ArcSwap::from_pointee(SdParams::new()),
        }
    }
}
