// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use crate::{
    device::TpmDevice,
    flush::{flush_handles, HandleCategory},
    import_blob::ImportBlob,
    pcr::PcrIndex,
    persistent::PersistentHandle,
    scoped::with_key,
    sign::sign_payload,
    tpm::TpmError,
};
use base64::{engine::general_purpose, Engine as _};
use log::*;

/// Options of the key import sequence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOptions {
    /// Handles flushed before importing
    pub flush: HandleCategory,
    /// Address where the imported key is persisted
    pub persistent_handle: PersistentHandle,
    /// Evict the object already persisted at `persistent_handle`
    pub evict: bool,
    /// PCR the test signature is bound to
    pub pcr: Option<PcrIndex>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            flush: HandleCategory::Transient,
            persistent_handle: PersistentHandle::default(),
            evict: false,
            pcr: None,
        }
    }
}

/// Result of a successful import
#[derive(Clone, Debug)]
pub struct ImportOutcome {
    /// Saved context of the imported key, loadable by the signer
    pub key_context: Vec<u8>,
    /// Signature of the test payload made with the imported key
    pub signature: Vec<u8>,
}

/// Warns when the PCR binding requested for the test signature cannot
/// satisfy the PCR policy carried by the import blob.
///
/// Returns whether the binding matches the policy.
fn check_pcr_policy(blob: &ImportBlob, pcr: Option<PcrIndex>) -> bool {
    let Some(policy) = &blob.pcrs else {
        return true;
    };

    let indices = policy.indices();
    info!("Key policy bound to PCR(s) {indices:?}");
    match pcr {
        None => {
            warn!("Key policy requires PCR(s) {indices:?} but no PCR binding is set, signing is likely to fail");
            false
        }
        Some(pcr) if !indices.contains(&u32::from(pcr.index())) => {
            warn!("PCR {pcr} is not part of the key policy, signing is likely to fail");
            false
        }
        Some(_) => true,
    }
}

/// Imports `blob` under the endorsement key and persists it.
///
/// Steps already done are not rolled back when a later one fails: a key
/// persisted before a signing failure stays in the TPM.
pub fn import_signing_key<D: TpmDevice>(
    device: &mut D,
    blob: &ImportBlob,
    options: &ImportOptions,
) -> Result<ImportOutcome, TpmError> {
    let _ = flush_handles(device, options.flush)?;

    let _ = check_pcr_policy(blob, options.pcr);

    if let Some(pcr) = options.pcr {
        let value = device
            .read_pcr(pcr)
            .map_err(|source| TpmError::TSSPCRRead { pcr, source })?;
        info!(
            "PCR {pcr} value: {}",
            general_purpose::STANDARD.encode(value)
        );
    }

    let ek = device
        .create_endorsement_key()
        .map_err(|source| TpmError::TSSCreateEKError { source })?;

    let key = with_key(device, ek, |device, ek| {
        device
            .import_key(ek, blob)
            .map_err(|source| TpmError::TSSImportKey { source })
    })?;
    info!("Signing key imported");

    let handle = options.persistent_handle;
    with_key(device, key, |device, key| {
        if options.evict {
            let evicted = device
                .evict(handle)
                .map_err(|source| TpmError::TSSEvictControl { handle, source })?;
            if evicted {
                info!("Evicted key persisted at {handle}");
            } else {
                debug!("No key persisted at {handle}, nothing to evict");
            }
        }

        device
            .persist(key, handle)
            .map_err(|source| TpmError::TSSPersistKey { handle, source })?;
        info!("Signing key persisted at {handle}");

        let key_context = device
            .context_save(key)
            .map_err(|source| TpmError::TSSContextSave { source })?;

        let signature = sign_payload(device, key, options.pcr)?;
        info!(
            "Signature: {}",
            general_purpose::STANDARD.encode(&signature)
        );

        Ok(ImportOutcome {
            key_context,
            signature,
        })
    })
}
