// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire and storage codec.
//!
//! The core stores and transports everything as JSON: document-store columns,
//! cache values and pub/sub invalidation payloads are all plain JSON, which
//! keeps the cache and the backing store trivially interchangeable.

use serde::{de::DeserializeOwned, Serialize};
use sqlx::{encode::IsNull, error::BoxDynError, Database, Decode, Encode, Type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error encoding value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("error decoding value: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(Error::Encode)
}

pub fn to_string<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(Error::Encode)
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(Error::Decode)
}

pub fn from_str<T: DeserializeOwned>(s: &str) -> Result<T, Error> {
    serde_json::from_str(s).map_err(Error::Decode)
}

/// Wraps a value so that sqlx encodes it as a JSON blob column.
pub struct BlobEncoded<T: Serialize>(pub T);

impl<DB: Database, T: Serialize> Type<DB> for BlobEncoded<T>
where
    Vec<u8>: Type<DB>,
{
    fn type_info() -> <DB as Database>::TypeInfo {
        Vec::<u8>::type_info()
    }
}

impl<'q, DB: Database, T: Serialize> Encode<'q, DB> for BlobEncoded<T>
where
    Vec<u8>: Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        let bytes = to_vec(&self.0)?;
        Encode::<DB>::encode(bytes, buf)
    }
}

/// The decoding counterpart of [`BlobEncoded`].
#[derive(Debug)]
pub struct BlobDecoded<T>(pub T);

impl<T> BlobDecoded<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<DB: Database, T: DeserializeOwned> Type<DB> for BlobDecoded<T>
where
    Vec<u8>: Type<DB>,
{
    fn type_info() -> <DB as Database>::TypeInfo {
        Vec::<u8>::type_info()
    }
}

impl<'q, DB: Database, T: DeserializeOwned> Decode<'q, DB> for BlobDecoded<T>
where
    for<'a> &'a [u8]: Decode<'a, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'q>) -> Result<Self, BoxDynError> {
        let bytes: &[u8] = Decode::<DB>::decode(value)?;
        from_slice(bytes).map(BlobDecoded).map_err(From::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Example {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_through_json() {
        let value = Example {
            a: 7,
            b: "hi".to_string(),
        };
        let bytes = to_vec(&value).unwrap();
        let back: Example = from_slice(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
