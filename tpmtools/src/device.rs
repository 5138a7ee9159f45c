// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

//! The TPM operations sequenced by the tools.
//!
//! [`TpmDevice`] is the seam between the command sequences (flush, import,
//! sign) and the TPM itself. [`crate::tpm::Context`] implements it on top of
//! `tss_esapi`; the unit tests implement it with an in-memory simulator.

use crate::{
    import_blob::ImportBlob, pcr::PcrIndex, persistent::PersistentHandle,
};
use std::fmt;

/// First handle of the transient object range
pub const TRANSIENT_FIRST: u32 = 0x8000_0000;
/// First handle of the loaded session range
pub const LOADED_SESSION_FIRST: u32 = 0x0200_0000;
/// First handle of the saved session range
pub const SAVED_SESSION_FIRST: u32 = 0x0300_0000;

/// Classes of TPM handles that can be enumerated and flushed
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleClass {
    Transient,
    LoadedSession,
    SavedSession,
}

impl HandleClass {
    /// First handle value of the class, used as the capability property
    pub fn first(&self) -> u32 {
        match self {
            HandleClass::Transient => TRANSIENT_FIRST,
            HandleClass::LoadedSession => LOADED_SESSION_FIRST,
            HandleClass::SavedSession => SAVED_SESSION_FIRST,
        }
    }

    /// Checks if `handle` belongs to this class, based on its handle type byte
    pub fn contains(&self, handle: u32) -> bool {
        handle >> 24 == self.first() >> 24
    }
}

impl fmt::Display for HandleClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let value = match self {
            HandleClass::Transient => "transient",
            HandleClass::LoadedSession => "loaded session",
            HandleClass::SavedSession => "saved session",
        };
        write!(f, "{value}")
    }
}

/// A key object loaded in the TPM.
///
/// `handle` is the ESYS object reference. Persistent keys outlive the
/// process, so releasing them only closes the reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyObject {
    pub handle: u32,
    pub persistent: bool,
}

impl KeyObject {
    pub fn transient(handle: u32) -> Self {
        KeyObject {
            handle,
            persistent: false,
        }
    }

    pub fn persistent(handle: u32) -> Self {
        KeyObject {
            handle,
            persistent: true,
        }
    }
}

/// An authorization session started on the TPM
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionObject(pub u32);

impl SessionObject {
    pub fn handle(&self) -> u32 {
        self.0
    }
}

/// Operations a TPM has to offer to run the import and signing sequences.
///
/// Every method maps to one TPM (or ESAPI) call and reports the raw
/// `tss_esapi` error; callers attach the failing step.
pub trait TpmDevice {
    /// Validation ticket produced by [`TpmDevice::hash`] and consumed by
    /// [`TpmDevice::sign`]
    type Ticket;

    /// Lists the handles of `class` currently resident in the TPM
    fn handles(&mut self, class: HandleClass) -> tss_esapi::Result<Vec<u32>>;

    /// Releases the TPM handle `handle`
    fn flush_handle(&mut self, handle: u32) -> tss_esapi::Result<()>;

    /// Reads the SHA-256 bank value of `pcr`
    fn read_pcr(&mut self, pcr: PcrIndex) -> tss_esapi::Result<Vec<u8>>;

    /// Creates the RSA endorsement key from the default template
    fn create_endorsement_key(&mut self) -> tss_esapi::Result<KeyObject>;

    /// Imports the wrapped key in `blob` under `parent` and loads it
    fn import_key(
        &mut self,
        parent: KeyObject,
        blob: &ImportBlob,
    ) -> tss_esapi::Result<KeyObject>;

    /// Loads a key from a context previously produced by
    /// [`TpmDevice::context_save`]
    fn context_load(&mut self, context: &[u8]) -> tss_esapi::Result<KeyObject>;

    /// Saves the context of a transient key
    fn context_save(&mut self, key: KeyObject) -> tss_esapi::Result<Vec<u8>>;

    /// References the key persisted at `handle`
    fn persistent_key(
        &mut self,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<KeyObject>;

    /// Evicts the object persisted at `handle`.
    ///
    /// Returns `false` if nothing was persisted there.
    fn evict(&mut self, handle: PersistentHandle) -> tss_esapi::Result<bool>;

    /// Makes `key` persistent at `handle`
    fn persist(
        &mut self,
        key: KeyObject,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<()>;

    /// Starts a SHA-256 policy session
    fn start_policy_session(&mut self) -> tss_esapi::Result<SessionObject>;

    /// Extends the policy of `session` with the current value of `pcr`
    fn policy_pcr(
        &mut self,
        session: SessionObject,
        pcr: PcrIndex,
    ) -> tss_esapi::Result<()>;

    /// Hashes `data` with SHA-256 in the TPM, in the owner hierarchy
    fn hash(&mut self, data: &[u8])
        -> tss_esapi::Result<(Vec<u8>, Self::Ticket)>;

    /// Signs `digest` with `key` using RSASSA/SHA-256.
    ///
    /// The key is authorized with `session` when given, and with an empty
    /// password otherwise.
    fn sign(
        &mut self,
        key: KeyObject,
        session: Option<SessionObject>,
        digest: &[u8],
        ticket: Self::Ticket,
    ) -> tss_esapi::Result<Vec<u8>>;

    /// Releases a key: transient keys are flushed, persistent ones closed
    fn close_key(&mut self, key: KeyObject) -> tss_esapi::Result<()>;

    /// Flushes an authorization session
    fn close_session(&mut self, session: SessionObject)
        -> tss_esapi::Result<()>;
}
