// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers, wire codec and shared error types used by the messaging core
//! and its backing services.

pub mod codec;
pub mod error;
pub mod ids;
pub mod time;

pub const DEFAULT_DOC_SHARD_SIZE: i64 = 100;

/// Reserved element id used in [`ids`]-domain version logs to signal that the
/// ordering of the parent collection changed without a per-element diff.
pub const SORT_MARKER_EID: &str = "__sort_marker__";
