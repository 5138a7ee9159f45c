// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

//! Signing key wrapped for import under the endorsement key.
//!
//! The file holds the protobuf `ImportBlob` message produced by the
//! go-tpm-tools server:
//!
//! ```text
//! message ImportBlob {
//!   bytes duplicate = 1;       // TPM2B_PRIVATE buffer
//!   bytes encrypted_seed = 2;  // TPM2B_ENCRYPTED_SECRET buffer
//!   bytes public_area = 3;     // marshalled TPMT_PUBLIC
//!   Pcrs pcrs = 4;             // PCR values the key policy is bound to
//! }
//! message Pcrs {
//!   HashAlgo hash = 1;
//!   map<uint32, bytes> pcrs = 2;
//! }
//! ```

use crate::pcr::MAX_PCR_INDEX;
use prost::Message;
use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;

/// `HashAlgo` value of the SHA-256 PCR bank (TPM_ALG_SHA256)
pub const PCR_HASH_SHA256: i32 = 0x000B;

mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub(super) struct ImportBlob {
        #[prost(bytes = "vec", tag = "1")]
        pub duplicate: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub encrypted_seed: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub public_area: Vec<u8>,
        #[prost(message, optional, tag = "4")]
        pub pcrs: Option<Pcrs>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub(super) struct Pcrs {
        #[prost(int32, tag = "1")]
        pub hash: i32,
        #[prost(map = "uint32, bytes", tag = "2")]
        pub pcrs: HashMap<u32, Vec<u8>>,
    }
}

#[derive(Error, Debug)]
pub enum ImportBlobError {
    #[error("Failed to decode import blob")]
    Decode(#[source] prost::DecodeError),

    #[error("Import blob has no {field}")]
    MissingField { field: &'static str },

    #[error("Import blob PCR policy uses hash algorithm {0:#06x}, only SHA-256 ({PCR_HASH_SHA256:#06x}) is supported")]
    UnsupportedPcrHash(i32),

    #[error("Import blob PCR policy names PCR {0}, outside of 0-{MAX_PCR_INDEX}")]
    InvalidPcrIndex(u32),

    #[error("Failed to read import blob from {path}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// PCR values the imported key's authorization policy was computed from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrPolicy {
    pub hash: i32,
    pub values: BTreeMap<u32, Vec<u8>>,
}

impl PcrPolicy {
    /// PCR indexes in the policy, in ascending order
    pub fn indices(&self) -> Vec<u32> {
        self.values.keys().copied().collect()
    }
}

/// A key duplicated for the endorsement key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportBlob {
    pub duplicate: Vec<u8>,
    pub encrypted_seed: Vec<u8>,
    pub public_area: Vec<u8>,
    pub pcrs: Option<PcrPolicy>,
}

fn required(
    value: Vec<u8>,
    field: &'static str,
) -> Result<Vec<u8>, ImportBlobError> {
    if value.is_empty() {
        return Err(ImportBlobError::MissingField { field });
    }
    Ok(value)
}

impl TryFrom<proto::Pcrs> for PcrPolicy {
    type Error = ImportBlobError;

    fn try_from(pcrs: proto::Pcrs) -> Result<Self, Self::Error> {
        if pcrs.hash != PCR_HASH_SHA256 {
            return Err(ImportBlobError::UnsupportedPcrHash(pcrs.hash));
        }
        if let Some(index) =
            pcrs.pcrs.keys().find(|i| **i > u32::from(MAX_PCR_INDEX))
        {
            return Err(ImportBlobError::InvalidPcrIndex(*index));
        }

        Ok(PcrPolicy {
            hash: pcrs.hash,
            values: pcrs.pcrs.into_iter().collect(),
        })
    }
}

impl ImportBlob {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ImportBlobError> {
        let msg =
            proto::ImportBlob::decode(data).map_err(ImportBlobError::Decode)?;

        // An empty PCR map carries no policy
        let pcrs = match msg.pcrs {
            Some(pcrs) if !pcrs.pcrs.is_empty() => {
                Some(PcrPolicy::try_from(pcrs)?)
            }
            _ => None,
        };

        Ok(ImportBlob {
            duplicate: required(msg.duplicate, "duplicate")?,
            encrypted_seed: required(msg.encrypted_seed, "encrypted seed")?,
            public_area: required(msg.public_area, "public area")?,
            pcrs,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImportBlobError> {
        let path = path.as_ref();
        let data =
            fs::read(path).map_err(|source| ImportBlobError::Read {
                path: path.display().to_string(),
                source,
            })?;
        ImportBlob::from_bytes(&data)
    }

    /// Encodes the blob as the protobuf message
    pub fn to_bytes(&self) -> Vec<u8> {
        proto::ImportBlob {
            duplicate: self.duplicate.clone(),
            encrypted_seed: self.encrypted_seed.clone(),
            public_area: self.public_area.clone(),
            pcrs: self.pcrs.as_ref().map(|policy| proto::Pcrs {
                hash: policy.hash,
                pcrs: policy
                    .values
                    .iter()
                    .map(|(i, v)| (*i, v.clone()))
                    .collect(),
            }),
        }
        .encode_to_vec()
    }
}
