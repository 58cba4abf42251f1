// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transaction contexts and the table that correlates them.

mod table;
mod transaction;

pub use table::{Cancelled, ContextTable, Location, Match, TableStats};
pub use transaction::{BatchCallback, Reassembly, ReplyCallback, Transaction, TxKind, TxState};
