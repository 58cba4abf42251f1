// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # fabsd - fabric subnet driver client
//!
//! Client-side plumbing for talking to a fabric's subnet administrator:
//! correlated request/response transactions with retries, busy backoff and
//! an in-flight ceiling, plus a multicast group membership manager built on
//! top of them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fabsd::{SdParams, SubnetDriver, UdpTransport, Request, Method, attr, PortGuid};
//!
//! # fn main() -> fabsd::Result<()> {
//! let port = PortGuid(0x0002_c903_0000_0001);
//! let transport = Arc::new(UdpTransport::bind(port, "0.0.0.0:0".parse().unwrap())?);
//! let driver = SubnetDriver::with_params(SdParams::from_env()?, transport)?;
//! driver.start()?;
//!
//! let client = driver.register(None)?;
//! driver.send_request(
//!     client,
//!     port,
//!     Request::new(Method::GetTable, attr::NODE_RECORD, Vec::new()),
//!     Box::new(|result| println!("{:?}", result.map(|r| r.payload.len()))),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  SubnetDriver   register / send_request / join_group / ...    |
//! +------------------------------+-------------------------------+
//! |  McManager                   |  ClientRegistry               |
//! |  groups, timers, sweep       |  handles, retry policies      |
//! +------------------------------+-------------------------------+
//! |  QueryEngine   ceiling, retries, busy backoff, reassembly     |
//! |  ContextTable  pending / in-use / completed, deadline heap    |
//! +--------------------------------------------------------------+
//! |  CaPortCache   default + redirected addressing per port       |
//! +--------------------------------------------------------------+
//! |  Transport     LoopbackTransport | UdpTransport               |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`driver`] - threads, client API, port events (start here)
//! - [`query`] - transactional query engine
//! - [`context`] - transaction records and the context table
//! - [`multicast`] - group membership state machine
//! - [`transport`] - datagram transports
//! - [`config`] - constants and runtime parameters

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod multicast;
pub mod port;
pub mod query;
pub mod registry;
pub mod transport;
pub mod types;
pub mod wake;

pub use config::{RuntimeConfig, SdParams};
pub use context::{BatchCallback, ReplyCallback, TxState};
pub use driver::{PortEvent, SubnetDriver};
pub use error::{Result, SdError};
pub use metrics::MetricsSnapshot;
pub use multicast::{
    GroupId, InformInfo, JoinState, JoinVersion, McCallback, McFlags, McGroupState, McManager,
    McMemberRecord, McNotification, TopologyTrap,
};
pub use port::{CaPortCache, PortAttributes};
pub use query::{Disposition, QueryEngine, Submitted};
pub use registry::ClientRegistry;
pub use transport::{LoopbackTransport, Transport, UdpTransport};
pub use types::{
    attr, ClientHandle, Gid, Lid, MadStatus, Method, PortGuid, Reply, Request, RetryPolicy,
    TransactionId,
};
