// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use crate::{
    device::{KeyObject, TpmDevice},
    pcr::PcrIndex,
    scoped::with_session,
    tpm::TpmError,
};
use base64::{engine::general_purpose, Engine as _};
use log::*;
use openssl::hash::{hash, MessageDigest};

/// Message signed to prove that a key is usable
pub const TEST_PAYLOAD: &[u8] = b"foobar";

/// Signs [`TEST_PAYLOAD`] with `key` using RSASSA/SHA-256.
///
/// The payload is hashed by the TPM, which issues the ticket the signing
/// operation needs. When `pcr` is set, the key is authorized through a
/// policy session bound to the current value of that PCR; otherwise the
/// policy session is unused and the key is authorized with an empty
/// password.
pub fn sign_payload<D: TpmDevice>(
    device: &mut D,
    key: KeyObject,
    pcr: Option<PcrIndex>,
) -> Result<Vec<u8>, TpmError> {
    let expected = hash(MessageDigest::sha256(), TEST_PAYLOAD)
        .map_err(|source| TpmError::OpenSSLHasher { source })?;

    with_session(device, |device, session| {
        if let Some(pcr) = pcr {
            device
                .policy_pcr(session, pcr)
                .map_err(|source| TpmError::TSSPolicyPCR { pcr, source })?;
            debug!("Policy session bound to PCR {pcr}");
        }

        let (digest, ticket) = device
            .hash(TEST_PAYLOAD)
            .map_err(|source| TpmError::TSSHash { source })?;
        debug!("TPM digest: {}", general_purpose::STANDARD.encode(&digest));

        if digest.as_slice() != &*expected {
            return Err(TpmError::DigestMismatch {
                expected: general_purpose::STANDARD.encode(&*expected),
                got: general_purpose::STANDARD.encode(&digest),
            });
        }

        let session = pcr.map(|_| session);
        device
            .sign(key, session, &digest, ticket)
            .map_err(|source| TpmError::TSSSign { source })
    })
}
