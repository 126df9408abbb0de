// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

pub use imcommon::error::{CoreError, CoreResult};
use thiserror::Error;

/// Low-level error from the KV gateway (§4.1/§4.2). Infrastructure errors
/// never escape a public API unwrapped; callers convert via `From`.
#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("lock held by another process")]
    Locked,
    #[error(transparent)]
    Codec(#[from] imcommon::codec::Error),
}

impl From<KvError> for CoreError {
    fn from(e: KvError) -> Self {
        CoreError::Internal(Box::new(e))
    }
}

/// Error raised while accessing the sequence allocator (§4.5).
#[derive(Debug, Error)]
pub enum SeqError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("could not acquire the reservation lock after {0} attempts")]
    Timeout(u32),
    #[error("conversation id mismatch between kv and caller")]
    LibraryError,
}

impl From<SeqError> for CoreError {
    fn from(e: SeqError) -> Self {
        match e {
            SeqError::Timeout(attempts) => {
                CoreError::Busy(format!("sequence allocator busy after {attempts} attempts"))
            }
            other => CoreError::Internal(Box::new(other)),
        }
    }
}
