// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use crate::{
    device::{HandleClass, KeyObject, SessionObject, TpmDevice},
    import_blob::ImportBlob,
    pcr::PcrIndex,
    persistent::PersistentHandle,
};
use log::*;
use std::{collections::HashMap, convert::TryFrom, str::FromStr};
use thiserror::Error;
use tss_esapi::{
    abstraction::{ek, pcr, AsymmetricAlgorithmSelection, DefaultKey},
    constants::{
        response_code::Tss2ResponseCodeKind, CapabilityType, SessionType,
    },
    handles::{
        AuthHandle, KeyHandle, ObjectHandle, PersistentTpmHandle,
        SessionHandle, TpmHandle,
    },
    interface_types::{
        algorithm::HashingAlgorithm,
        dynamic_handles::Persistent,
        key_bits::RsaKeyBits,
        resource_handles::{Hierarchy, Provision},
        session_handles::{AuthSession, PolicySession},
    },
    structures::{
        CapabilityData, Digest, EncryptedSecret, HashScheme, HashcheckTicket,
        MaxBuffer, Private, Public, Signature, SignatureScheme,
        SymmetricDefinition, SymmetricDefinitionObject,
    },
    tcti_ldr::TctiNameConf,
    traits::UnMarshall,
    utils::TpmsContext,
    Error::Tss2Error,
    WrapperErrorKind,
};

/// TPM used when no path is given
pub const DEFAULT_TPM_PATH: &str = "/dev/tpm0";

/// Environment variable read when `--tpm-path` is not given
pub const TPM_PATH_ENV_VAR: &str = "TPMTOOLS_TPM_PATH";

/// Prefixes of the TCTI configuration strings accepted as TPM path
const TCTI_PREFIXES: [&str; 4] = ["device:", "mssim:", "swtpm:", "tabrmd"];

/// Maximum number of handles requested per capability query
const MAX_HANDLES_PER_QUERY: u32 = 64;

#[derive(Error, Debug)]
pub enum TpmError {
    /// Error parsing the TCTI configuration
    #[error("Error parsing TCTI configuration '{path}'")]
    TctiNameError {
        path: String,
        source: tss_esapi::Error,
    },

    /// Error opening the TPM context
    #[error("Error creating TPM context")]
    TSSTctiContextError { source: tss_esapi::Error },

    /// Error listing handles
    #[error("Error listing {class} handles")]
    TSSGetCapability {
        class: HandleClass,
        source: tss_esapi::Error,
    },

    /// Error flushing a stale handle
    #[error("Error flushing handle {handle:#x}")]
    TSSFlushHandle {
        handle: u32,
        source: tss_esapi::Error,
    },

    /// Error reading a PCR value
    #[error("Error reading PCR {pcr}")]
    TSSPCRRead {
        pcr: PcrIndex,
        source: tss_esapi::Error,
    },

    /// Error creating EK object
    #[error("Error creating EK object")]
    TSSCreateEKError { source: tss_esapi::Error },

    /// Error importing the signing key
    #[error("Error importing signing key")]
    TSSImportKey { source: tss_esapi::Error },

    /// Error loading a key from its saved context
    #[error("Error loading key context")]
    TSSContextLoad { source: tss_esapi::Error },

    /// Error saving a key context
    #[error("Error saving key context")]
    TSSContextSave { source: tss_esapi::Error },

    /// Error creating handle from persistent TPM handle
    #[error("Error creating handle from persistent TPM handle {handle}")]
    TSSHandleFromPersistentHandleError {
        handle: PersistentHandle,
        source: tss_esapi::Error,
    },

    /// Error evicting the object persisted at a handle
    #[error("Error evicting persistent handle {handle}")]
    TSSEvictControl {
        handle: PersistentHandle,
        source: tss_esapi::Error,
    },

    /// Error persisting a key
    #[error("Error persisting key at handle {handle}")]
    TSSPersistKey {
        handle: PersistentHandle,
        source: tss_esapi::Error,
    },

    /// Error starting an authorization session
    #[error("Error starting authentication session")]
    TSSStartAuthenticationSessionError { source: tss_esapi::Error },

    /// Error binding the policy session to a PCR value
    #[error("Error binding policy session to PCR {pcr}")]
    TSSPolicyPCR {
        pcr: PcrIndex,
        source: tss_esapi::Error,
    },

    /// Error hashing the payload in the TPM
    #[error("Error hashing data in the TPM")]
    TSSHash { source: tss_esapi::Error },

    /// Error signing
    #[error("Error signing digest")]
    TSSSign { source: tss_esapi::Error },

    /// TPM digest differs from the locally computed one
    #[error("TPM digest {got} does not match expected digest {expected}")]
    DigestMismatch { expected: String, got: String },

    /// Error flushing object handle
    #[error("Error flushing object handle")]
    TSSFlushContext { source: tss_esapi::Error },

    /// Error closing an authorization session
    #[error("Error closing authorization session")]
    TSSCloseSession { source: tss_esapi::Error },

    /// Error hashing with OpenSSL
    #[error("Error hashing data with OpenSSL")]
    OpenSSLHasher { source: openssl::error::ErrorStack },

    /// Generic catch-all TPM device error
    #[error("TSS2 Error: {err:?}, kind: {kind:?}, {message}")]
    Tss2 {
        err: tss_esapi::Error,
        kind: Option<Tss2ResponseCodeKind>,
        message: String,
    },
}

impl From<tss_esapi::Error> for TpmError {
    fn from(err: tss_esapi::Error) -> Self {
        let kind = if let Tss2Error(tss2_rc) = err {
            tss2_rc.kind()
        } else {
            None
        };
        let message = format!("{err}");

        TpmError::Tss2 { err, kind, message }
    }
}

type Result<T> = std::result::Result<T, TpmError>;

fn invalid_param() -> tss_esapi::Error {
    tss_esapi::Error::WrapperError(WrapperErrorKind::InvalidParam)
}

/// Turns the `tpm_path` option into a TCTI configuration string.
///
/// Full TCTI strings are used as they are; anything else is taken as the
/// path of a TPM device node.
pub fn tcti_from_path(tpm_path: &str) -> String {
    if TCTI_PREFIXES.iter().any(|p| tpm_path.starts_with(p)) {
        tpm_path.to_string()
    } else {
        format!("device:{tpm_path}")
    }
}

/// TPM context used by the tools.
///
/// Wraps the ESAPI context and keeps track of the authorization sessions it
/// started, so they can be referenced through [`SessionObject`].
pub struct Context {
    inner: tss_esapi::Context,
    sessions: HashMap<u32, AuthSession>,
}

impl Context {
    /// Opens the TPM at `tpm_path`, a device node or a TCTI string
    pub fn open(tpm_path: &str) -> Result<Self> {
        let tcti_path = tcti_from_path(tpm_path);
        let tcti = TctiNameConf::from_str(&tcti_path).map_err(|source| {
            TpmError::TctiNameError {
                path: tcti_path.to_string(),
                source,
            }
        })?;

        let mut inner = tss_esapi::Context::new(tcti)
            .map_err(|source| TpmError::TSSTctiContextError { source })?;

        // Retrieve the TPM vendor, this allows us to warn if someone is using a
        // software TPM ("SW")
        match tss_esapi::utils::get_tpm_vendor(&mut inner) {
            Ok(vendor) if vendor.contains("SW") => {
                warn!("INSECURE: using a software TPM emulator rather than a real hardware TPM.");
                warn!("INSECURE: Only use this mode for testing or debugging purposes.");
            }
            Ok(_) => {}
            Err(e) => debug!("Could not read TPM vendor: {e}"),
        }

        debug!("Opened TPM at {tcti_path}");

        Ok(Context {
            inner,
            sessions: HashMap::new(),
        })
    }

    fn auth_session(
        &self,
        session: SessionObject,
    ) -> tss_esapi::Result<AuthSession> {
        self.sessions
            .get(&session.handle())
            .copied()
            .ok_or_else(invalid_param)
    }

    fn is_persisted(
        &mut self,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<bool> {
        let (capability, _) = self.inner.get_capability(
            CapabilityType::Handles,
            handle.value(),
            1,
        )?;
        Ok(match capability {
            CapabilityData::Handles(list) => list
                .into_inner()
                .into_iter()
                .any(|h| u32::from(h) == handle.value()),
            _ => false,
        })
    }

    /// Lists the handles of `class`, asking for at most `page_size` handles
    /// per capability query
    fn list_handles(
        &mut self,
        class: HandleClass,
        page_size: u32,
    ) -> tss_esapi::Result<Vec<u32>> {
        let mut handles = Vec::new();
        let mut property = class.first();

        loop {
            let (capability, more) = self.inner.get_capability(
                CapabilityType::Handles,
                property,
                page_size,
            )?;

            let list = match capability {
                CapabilityData::Handles(list) => list
                    .into_inner()
                    .into_iter()
                    .map(u32::from)
                    .filter(|h| class.contains(*h))
                    .collect::<Vec<u32>>(),
                _ => Vec::new(),
            };

            let last = list.last().copied();
            handles.extend(list);

            match last {
                Some(h) if more => property = h + 1,
                _ => break,
            }
        }

        Ok(handles)
    }

    /// Runs `f` with a policy session satisfying the endorsement key policy
    /// (PolicySecret on the endorsement hierarchy), flushing it afterwards.
    fn with_ek_policy<T, F>(&mut self, f: F) -> tss_esapi::Result<T>
    where
        F: FnOnce(
            &mut tss_esapi::Context,
            AuthSession,
        ) -> tss_esapi::Result<T>,
    {
        let ek_auth = self
            .inner
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(invalid_param)?;

        let result = self.inner.execute_with_temporary_object(
            SessionHandle::from(ek_auth).into(),
            |ctx, _| {
                let _ = ctx.execute_with_nullauth_session(|ctx| {
                    ctx.policy_secret(
                        PolicySession::try_from(ek_auth)?,
                        AuthHandle::Endorsement,
                        Default::default(),
                        Default::default(),
                        Default::default(),
                        None,
                    )
                })?;
                f(ctx, ek_auth)
            },
        );

        self.inner.clear_sessions();
        result
    }
}

impl TpmDevice for Context {
    type Ticket = HashcheckTicket;

    fn handles(&mut self, class: HandleClass) -> tss_esapi::Result<Vec<u32>> {
        self.list_handles(class, MAX_HANDLES_PER_QUERY)
    }

    fn flush_handle(&mut self, handle: u32) -> tss_esapi::Result<()> {
        let tpm_handle = TpmHandle::try_from(handle)?;
        let object = self.inner.tr_from_tpm_public(tpm_handle)?;
        self.inner.flush_context(object)
    }

    fn read_pcr(&mut self, pcr: PcrIndex) -> tss_esapi::Result<Vec<u8>> {
        let selection = pcr.selection()?;
        let pcr_data = self
            .inner
            .execute_without_session(|ctx| pcr::read_all(ctx, selection))?;
        let digest = pcr_data
            .pcr_bank(HashingAlgorithm::Sha256)
            .and_then(|bank| bank.get_digest(pcr.slot()))
            .ok_or_else(invalid_param)?;
        Ok(digest.value().to_vec())
    }

    fn create_endorsement_key(&mut self) -> tss_esapi::Result<KeyObject> {
        let handle = ek::create_ek_object_2(
            &mut self.inner,
            AsymmetricAlgorithmSelection::Rsa(RsaKeyBits::Rsa2048),
            DefaultKey,
        )?;
        Ok(KeyObject::transient(handle.into()))
    }

    fn import_key(
        &mut self,
        parent: KeyObject,
        blob: &ImportBlob,
    ) -> tss_esapi::Result<KeyObject> {
        let public = Public::unmarshall(&blob.public_area)?;
        let duplicate = Private::try_from(blob.duplicate.clone())?;
        let seed = EncryptedSecret::try_from(blob.encrypted_seed.clone())?;
        let parent_handle = KeyHandle::from(parent.handle);

        let private = self.with_ek_policy(|ctx, ek_auth| {
            ctx.execute_with_session(Some(ek_auth), |ctx| {
                ctx.import(
                    parent_handle.into(),
                    None,
                    public.clone(),
                    duplicate,
                    seed,
                    SymmetricDefinitionObject::Null,
                )
            })
        })?;

        let key = self.with_ek_policy(|ctx, ek_auth| {
            ctx.execute_with_session(Some(ek_auth), |ctx| {
                ctx.load(parent_handle, private, public)
            })
        })?;

        Ok(KeyObject::transient(key.into()))
    }

    fn context_load(&mut self, context: &[u8]) -> tss_esapi::Result<KeyObject> {
        let saved: TpmsContext =
            serde_json::from_slice(context).map_err(|e| {
                error!("Invalid key context: {e}");
                invalid_param()
            })?;
        let handle = self.inner.context_load(saved)?;
        Ok(KeyObject::transient(handle.into()))
    }

    fn context_save(&mut self, key: KeyObject) -> tss_esapi::Result<Vec<u8>> {
        let saved = self.inner.context_save(ObjectHandle::from(key.handle))?;
        serde_json::to_vec(&saved).map_err(|e| {
            error!("Could not serialize key context: {e}");
            invalid_param()
        })
    }

    fn persistent_key(
        &mut self,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<KeyObject> {
        let tpm_handle = PersistentTpmHandle::new(handle.value())?;
        let object = self
            .inner
            .tr_from_tpm_public(TpmHandle::Persistent(tpm_handle))?;
        Ok(KeyObject::persistent(object.into()))
    }

    fn evict(&mut self, handle: PersistentHandle) -> tss_esapi::Result<bool> {
        if !self.is_persisted(handle)? {
            return Ok(false);
        }

        let tpm_handle = PersistentTpmHandle::new(handle.value())?;
        let object = self
            .inner
            .tr_from_tpm_public(TpmHandle::Persistent(tpm_handle))?;
        let _ = self.inner.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(
                Provision::Owner,
                object,
                Persistent::Persistent(tpm_handle),
            )
        })?;
        Ok(true)
    }

    fn persist(
        &mut self,
        key: KeyObject,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<()> {
        let tpm_handle = PersistentTpmHandle::new(handle.value())?;
        let mut persisted =
            self.inner.execute_with_nullauth_session(|ctx| {
                ctx.evict_control(
                    Provision::Owner,
                    ObjectHandle::from(key.handle),
                    Persistent::Persistent(tpm_handle),
                )
            })?;
        self.inner.tr_close(&mut persisted)
    }

    fn start_policy_session(&mut self) -> tss_esapi::Result<SessionObject> {
        let session = self
            .inner
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::Null,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(invalid_param)?;
        let handle: u32 = SessionHandle::from(session).into();
        let _ = self.sessions.insert(handle, session);
        Ok(SessionObject(handle))
    }

    fn policy_pcr(
        &mut self,
        session: SessionObject,
        pcr: PcrIndex,
    ) -> tss_esapi::Result<()> {
        let policy = PolicySession::try_from(self.auth_session(session)?)?;
        let selection = pcr.selection()?;
        self.inner.policy_pcr(policy, Digest::default(), selection)
    }

    fn hash(
        &mut self,
        data: &[u8],
    ) -> tss_esapi::Result<(Vec<u8>, Self::Ticket)> {
        let buffer = MaxBuffer::try_from(data.to_vec())?;
        let (digest, ticket) = self.inner.execute_without_session(|ctx| {
            ctx.hash(buffer, HashingAlgorithm::Sha256, Hierarchy::Owner)
        })?;
        Ok((digest.value().to_vec(), ticket))
    }

    fn sign(
        &mut self,
        key: KeyObject,
        session: Option<SessionObject>,
        digest: &[u8],
        ticket: Self::Ticket,
    ) -> tss_esapi::Result<Vec<u8>> {
        let auth = match session {
            Some(s) => self.auth_session(s)?,
            None => AuthSession::Password,
        };
        let digest = Digest::try_from(digest.to_vec())?;
        let scheme = SignatureScheme::RsaSsa {
            hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
        };

        let signature = self.inner.execute_with_session(Some(auth), |ctx| {
            ctx.sign(KeyHandle::from(key.handle), digest, scheme, ticket)
        })?;

        match signature {
            Signature::RsaSsa(rsa) => Ok(rsa.signature().value().to_vec()),
            _ => Err(tss_esapi::Error::WrapperError(
                WrapperErrorKind::WrongValueFromTpm,
            )),
        }
    }

    fn close_key(&mut self, key: KeyObject) -> tss_esapi::Result<()> {
        let mut object = ObjectHandle::from(key.handle);
        if key.persistent {
            self.inner.tr_close(&mut object)
        } else {
            self.inner.flush_context(object)
        }
    }

    fn close_session(
        &mut self,
        session: SessionObject,
    ) -> tss_esapi::Result<()> {
        let auth = self.auth_session(session)?;
        let _ = self.sessions.remove(&session.handle());
        let result = self
            .inner
            .flush_context(SessionHandle::from(auth).into());
        self.inner.clear_sessions();
        result
    }
}
