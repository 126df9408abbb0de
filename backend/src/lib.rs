// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The messaging core: conversation sequence allocation, the message
//! transfer pipeline, cache coordination, version-log sync, and the
//! friend/group relational state machines.

pub mod cache;
pub mod cache_chain;
pub mod config;
pub mod error;
pub mod friend;
pub mod group;
pub mod kv;
pub mod model;
pub mod notification;
pub mod ports;
pub mod seq;
pub mod transfer;
pub mod version_log;
