// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

//! In-memory TPM used by the unit tests.
//!
//! It tracks the keys and sessions handed out so tests can check nothing is
//! leaked, records every operation, and can be told to fail a given step.
//! Signatures are real RSASSA/SHA-256 signatures made with an OpenSSL key.

use crate::{
    device::{HandleClass, KeyObject, SessionObject, TpmDevice},
    import_blob::ImportBlob,
    pcr::PcrIndex,
    persistent::PersistentHandle,
};
use openssl::{
    hash::MessageDigest,
    md::Md,
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::Verifier,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tss_esapi::WrapperErrorKind;

const MOCK_CONTEXT: &[u8] = b"mock signing key context";
const FIRST_OBJECT: u32 = 0x8000_0100;
const FIRST_SESSION: u32 = 0x0200_0100;
const FIRST_PERSISTENT_REF: u32 = 0x4000_1000;

fn wrapper_error(kind: WrapperErrorKind) -> tss_esapi::Error {
    tss_esapi::Error::WrapperError(kind)
}

pub(crate) struct MockTicket {
    digest: Vec<u8>,
}

pub(crate) struct MockTpm {
    signing_key: PKey<Private>,
    stale: BTreeSet<u32>,
    keys: BTreeMap<u32, bool>,
    sessions: BTreeSet<u32>,
    persisted: BTreeSet<u32>,
    next_object: u32,
    next_session: u32,
    next_persistent_ref: u32,
    failures: HashSet<String>,
    ops: Vec<String>,
    corrupt_hash: bool,
    last_sign_session: Option<bool>,
}

impl MockTpm {
    pub(crate) fn new() -> Self {
        let rsa = Rsa::generate(2048).unwrap(); //#[allow_ci]
        MockTpm {
            signing_key: PKey::from_rsa(rsa).unwrap(), //#[allow_ci]
            stale: BTreeSet::new(),
            keys: BTreeMap::new(),
            sessions: BTreeSet::new(),
            persisted: BTreeSet::new(),
            next_object: FIRST_OBJECT,
            next_session: FIRST_SESSION,
            next_persistent_ref: FIRST_PERSISTENT_REF,
            failures: HashSet::new(),
            ops: Vec::new(),
            corrupt_hash: false,
            last_sign_session: None,
        }
    }

    /// Handles left behind by an earlier process
    pub(crate) fn add_stale_handles(&mut self, handles: &[u32]) {
        self.stale.extend(handles);
    }

    /// Makes every following call of `op` fail
    pub(crate) fn fail_on(&mut self, op: &str) {
        let _ = self.failures.insert(op.to_string());
    }

    /// Makes the TPM hash differ from the SHA-256 of the data
    pub(crate) fn corrupt_hash(&mut self) {
        self.corrupt_hash = true;
    }

    pub(crate) fn ops(&self) -> &[String] {
        &self.ops
    }

    pub(crate) fn live_keys(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn is_persisted(&self, handle: PersistentHandle) -> bool {
        self.persisted.contains(&handle.value())
    }

    /// Whether the last signature was authorized by a policy session
    pub(crate) fn last_sign_session(&self) -> Option<bool> {
        self.last_sign_session
    }

    /// Loads the signing key as a transient object
    pub(crate) fn load_test_key(&mut self) -> KeyObject {
        self.new_transient()
    }

    /// Import blob wrapping the signing key
    pub(crate) fn wrap_test_key(&self) -> ImportBlob {
        ImportBlob {
            duplicate: vec![0x11; 32],
            encrypted_seed: vec![0x22; 256],
            public_area: vec![0x33; 64],
            pcrs: None,
        }
    }

    /// Verifies `signature` over `data` with the public part of the key
    pub(crate) fn verify(&self, signature: &[u8], data: &[u8]) -> bool {
        let mut verifier =
            Verifier::new(MessageDigest::sha256(), &self.signing_key).unwrap(); //#[allow_ci]
        verifier.verify_oneshot(signature, data).unwrap_or(false)
    }

    fn record(&mut self, op: &str, entry: String) -> tss_esapi::Result<()> {
        self.ops.push(entry);
        if self.failures.contains(op) {
            return Err(wrapper_error(WrapperErrorKind::InternalError));
        }
        Ok(())
    }

    fn new_transient(&mut self) -> KeyObject {
        let handle = self.next_object;
        self.next_object += 1;
        let _ = self.keys.insert(handle, false);
        KeyObject::transient(handle)
    }

    fn live_key(&self, key: KeyObject) -> tss_esapi::Result<()> {
        match self.keys.get(&key.handle) {
            Some(persistent) if *persistent == key.persistent => Ok(()),
            _ => Err(wrapper_error(WrapperErrorKind::InvalidHandleState)),
        }
    }

    fn live_session(&self, session: SessionObject) -> tss_esapi::Result<()> {
        if self.sessions.contains(&session.handle()) {
            Ok(())
        } else {
            Err(wrapper_error(WrapperErrorKind::InvalidHandleState))
        }
    }
}

impl TpmDevice for MockTpm {
    type Ticket = MockTicket;

    fn handles(&mut self, class: HandleClass) -> tss_esapi::Result<Vec<u32>> {
        self.record("handles", format!("handles {class}"))?;
        let transient = self
            .keys
            .iter()
            .filter(|(_, persistent)| !**persistent)
            .map(|(h, _)| *h);
        let mut handles: Vec<u32> = self
            .stale
            .iter()
            .copied()
            .chain(transient)
            .chain(self.sessions.iter().copied())
            .filter(|h| class.contains(*h))
            .collect();
        handles.sort_unstable();
        Ok(handles)
    }

    fn flush_handle(&mut self, handle: u32) -> tss_esapi::Result<()> {
        self.record("flush_handle", format!("flush_handle {handle:#x}"))?;
        let removed = self.stale.remove(&handle)
            || self.keys.remove(&handle).is_some()
            || self.sessions.remove(&handle);
        if removed {
            Ok(())
        } else {
            Err(wrapper_error(WrapperErrorKind::InvalidHandleState))
        }
    }

    fn read_pcr(&mut self, pcr: PcrIndex) -> tss_esapi::Result<Vec<u8>> {
        self.record("read_pcr", "read_pcr".to_string())?;
        Ok(vec![pcr.index(); 32])
    }

    fn create_endorsement_key(&mut self) -> tss_esapi::Result<KeyObject> {
        self.record("create_endorsement_key", "create_ek".to_string())?;
        Ok(self.new_transient())
    }

    fn import_key(
        &mut self,
        parent: KeyObject,
        blob: &ImportBlob,
    ) -> tss_esapi::Result<KeyObject> {
        self.record("import_key", "import_key".to_string())?;
        self.live_key(parent)?;
        if blob.duplicate.is_empty() || blob.public_area.is_empty() {
            return Err(wrapper_error(WrapperErrorKind::InvalidParam));
        }
        Ok(self.new_transient())
    }

    fn context_load(&mut self, context: &[u8]) -> tss_esapi::Result<KeyObject> {
        self.record("context_load", "context_load".to_string())?;
        if context != MOCK_CONTEXT {
            return Err(wrapper_error(WrapperErrorKind::InvalidParam));
        }
        Ok(self.new_transient())
    }

    fn context_save(&mut self, key: KeyObject) -> tss_esapi::Result<Vec<u8>> {
        self.record("context_save", "context_save".to_string())?;
        self.live_key(key)?;
        Ok(MOCK_CONTEXT.to_vec())
    }

    fn persistent_key(
        &mut self,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<KeyObject> {
        self.record("persistent_key", format!("persistent_key {handle}"))?;
        if !self.persisted.contains(&handle.value()) {
            return Err(wrapper_error(WrapperErrorKind::InvalidHandleState));
        }
        let reference = self.next_persistent_ref;
        self.next_persistent_ref += 1;
        let _ = self.keys.insert(reference, true);
        Ok(KeyObject::persistent(reference))
    }

    fn evict(&mut self, handle: PersistentHandle) -> tss_esapi::Result<bool> {
        self.record("evict", format!("evict {handle}"))?;
        Ok(self.persisted.remove(&handle.value()))
    }

    fn persist(
        &mut self,
        key: KeyObject,
        handle: PersistentHandle,
    ) -> tss_esapi::Result<()> {
        self.record("persist", format!("persist {handle}"))?;
        self.live_key(key)?;
        if !self.persisted.insert(handle.value()) {
            return Err(wrapper_error(WrapperErrorKind::InvalidHandleState));
        }
        Ok(())
    }

    fn start_policy_session(&mut self) -> tss_esapi::Result<SessionObject> {
        self.record("start_policy_session", "start_session".to_string())?;
        let handle = self.next_session;
        self.next_session += 1;
        let _ = self.sessions.insert(handle);
        Ok(SessionObject(handle))
    }

    fn policy_pcr(
        &mut self,
        session: SessionObject,
        _pcr: PcrIndex,
    ) -> tss_esapi::Result<()> {
        self.record("policy_pcr", "policy_pcr".to_string())?;
        self.live_session(session)
    }

    fn hash(
        &mut self,
        data: &[u8],
    ) -> tss_esapi::Result<(Vec<u8>, Self::Ticket)> {
        self.record("hash", "hash".to_string())?;
        let mut digest = openssl::sha::sha256(data).to_vec();
        if self.corrupt_hash {
            digest[0] ^= 0xff;
        }
        let ticket = MockTicket {
            digest: digest.clone(),
        };
        Ok((digest, ticket))
    }

    fn sign(
        &mut self,
        key: KeyObject,
        session: Option<SessionObject>,
        digest: &[u8],
        ticket: Self::Ticket,
    ) -> tss_esapi::Result<Vec<u8>> {
        self.record("sign", "sign".to_string())?;
        self.live_key(key)?;
        if let Some(session) = session {
            self.live_session(session)?;
        }
        if ticket.digest != digest {
            return Err(wrapper_error(WrapperErrorKind::InconsistentParams));
        }
        self.last_sign_session = Some(session.is_some());

        let internal = |_| wrapper_error(WrapperErrorKind::InternalError);
        let mut ctx = PkeyCtx::new(&self.signing_key).map_err(internal)?;
        ctx.sign_init().map_err(internal)?;
        ctx.set_rsa_padding(Padding::PKCS1).map_err(internal)?;
        ctx.set_signature_md(Md::sha256()).map_err(internal)?;
        let mut signature = Vec::new();
        let _ = ctx.sign_to_vec(digest, &mut signature).map_err(internal)?;
        Ok(signature)
    }

    fn close_key(&mut self, key: KeyObject) -> tss_esapi::Result<()> {
        self.record("close_key", "close_key".to_string())?;
        self.live_key(key)?;
        let _ = self.keys.remove(&key.handle);
        Ok(())
    }

    fn close_session(
        &mut self,
        session: SessionObject,
    ) -> tss_esapi::Result<()> {
        self.record("close_session", "close_session".to_string())?;
        if self.sessions.remove(&session.handle()) {
            Ok(())
        } else {
            Err(wrapper_error(WrapperErrorKind::InvalidHandleState))
        }
    }
}
