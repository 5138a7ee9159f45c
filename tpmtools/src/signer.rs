// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use crate::{
    device::TpmDevice,
    flush::{flush_handles, HandleCategory},
    pcr::PcrIndex,
    persistent::PersistentHandle,
    scoped::with_key,
    sign::sign_payload,
    tpm::TpmError,
};
use base64::{engine::general_purpose, Engine as _};
use log::*;

/// Where the signing key comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource {
    /// Saved key context, as written by the key importer
    Context(Vec<u8>),
    /// Key persisted in the TPM
    Persistent(PersistentHandle),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignOptions {
    pub flush: HandleCategory,
    pub key: KeySource,
    pub pcr: Option<PcrIndex>,
}

/// Loads the key described by `options` and signs the test payload with it
pub fn sign_with_key_source<D: TpmDevice>(
    device: &mut D,
    options: &SignOptions,
) -> Result<Vec<u8>, TpmError> {
    let _ = flush_handles(device, options.flush)?;

    let key = match &options.key {
        KeySource::Context(context) => device
            .context_load(context)
            .map_err(|source| TpmError::TSSContextLoad { source })?,
        KeySource::Persistent(handle) => {
            device.persistent_key(*handle).map_err(|source| {
                TpmError::TSSHandleFromPersistentHandleError {
                    handle: *handle,
                    source,
                }
            })?
        }
    };
    debug!("Signing key loaded");

    let signature = with_key(device, key, |device, key| {
        sign_payload(device, key, options.pcr)
    })?;
    info!("Signature: {}", general_purpose::STANDARD.encode(&signature));

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        import::{import_signing_key, ImportOptions},
        sign::TEST_PAYLOAD,
        testing::MockTpm,
    };

    fn imported() -> (MockTpm, Vec<u8>) {
        let mut tpm = MockTpm::new();
        let blob = tpm.wrap_test_key();
        let outcome =
            import_signing_key(&mut tpm, &blob, &ImportOptions::default())
                .unwrap(); //#[allow_ci]
        (tpm, outcome.key_context)
    }

    #[test]
    fn test_sign_with_context() {
        let (mut tpm, context) = imported();
        let options = SignOptions {
            flush: HandleCategory::All,
            key: KeySource::Context(context),
            pcr: None,
        };

        let signature = sign_with_key_source(&mut tpm, &options).unwrap(); //#[allow_ci]
        assert!(tpm.verify(&signature, TEST_PAYLOAD));
        assert_eq!(tpm.live_keys(), 0);
        assert_eq!(tpm.live_sessions(), 0);
    }

    #[test]
    fn test_sign_with_persistent_handle() {
        let (mut tpm, _) = imported();
        let options = SignOptions {
            flush: HandleCategory::All,
            key: KeySource::Persistent(PersistentHandle::default()),
            pcr: PcrIndex::new(7),
        };

        let signature = sign_with_key_source(&mut tpm, &options).unwrap(); //#[allow_ci]
        assert!(tpm.verify(&signature, TEST_PAYLOAD));
        assert_eq!(tpm.last_sign_session(), Some(true));
        assert_eq!(tpm.live_keys(), 0);
        // Persistent keys are only closed, never evicted by the signer
        assert!(tpm.is_persisted(PersistentHandle::default()));
    }

    #[test]
    fn test_missing_persistent_key() {
        let mut tpm = MockTpm::new();
        let options = SignOptions {
            flush: HandleCategory::All,
            key: KeySource::Persistent(PersistentHandle::default()),
            pcr: None,
        };

        let r = sign_with_key_source(&mut tpm, &options);
        assert!(matches!(
            r,
            Err(TpmError::TSSHandleFromPersistentHandleError { .. })
        ));
    }

    #[test]
    fn test_invalid_context() {
        let mut tpm = MockTpm::new();
        let options = SignOptions {
            flush: HandleCategory::All,
            key: KeySource::Context(b"garbage".to_vec()),
            pcr: None,
        };

        let r = sign_with_key_source(&mut tpm, &options);
        assert!(matches!(r, Err(TpmError::TSSContextLoad { .. })));
        assert_eq!(tpm.live_keys(), 0);
    }

    #[test]
    fn test_sign_failure_releases_key() {
        let (mut tpm, context) = imported();
        tpm.fail_on("sign");
        let options = SignOptions {
            flush: HandleCategory::Transient,
            key: KeySource::Context(context),
            pcr: PcrIndex::new(16),
        };

        let r = sign_with_key_source(&mut tpm, &options);
        assert!(matches!(r, Err(TpmError::TSSSign { .. })));
        assert_eq!(tpm.live_keys(), 0);
        assert_eq!(tpm.live_sessions(), 0);
    }
}
