// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

//! Closure-scoped use of TPM keys and sessions.
//!
//! The release step runs once the closure returns, whether it succeeded or
//! not. An error from the closure takes precedence over a release error.

use crate::{
    device::{KeyObject, SessionObject, TpmDevice},
    tpm::TpmError,
};
use log::*;

/// Runs `f` with `key`, then releases the key
pub fn with_key<D, T, F>(
    device: &mut D,
    key: KeyObject,
    f: F,
) -> Result<T, TpmError>
where
    D: TpmDevice,
    F: FnOnce(&mut D, KeyObject) -> Result<T, TpmError>,
{
    let result = f(device, key);
    let released = device
        .close_key(key)
        .map_err(|source| TpmError::TSSFlushContext { source });
    finish(result, released, "key")
}

/// Starts a policy session, runs `f` with it, then flushes the session
pub fn with_session<D, T, F>(device: &mut D, f: F) -> Result<T, TpmError>
where
    D: TpmDevice,
    F: FnOnce(&mut D, SessionObject) -> Result<T, TpmError>,
{
    let session = device.start_policy_session().map_err(|source| {
        TpmError::TSSStartAuthenticationSessionError { source }
    })?;
    let result = f(device, session);
    let released = device
        .close_session(session)
        .map_err(|source| TpmError::TSSCloseSession { source });
    finish(result, released, "session")
}

fn finish<T>(
    result: Result<T, TpmError>,
    released: Result<(), TpmError>,
    what: &str,
) -> Result<T, TpmError> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release)) => {
            warn!("Failed to release {what} after error: {release}");
            Err(e)
        }
    }
}
