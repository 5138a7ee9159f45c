// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

pub mod logging;

#[cfg(feature = "cert")]
pub mod cert;

#[cfg(feature = "tpm")]
pub mod device;
#[cfg(feature = "tpm")]
pub mod flush;
#[cfg(feature = "tpm")]
pub mod import;
#[cfg(feature = "tpm")]
pub mod import_blob;
#[cfg(feature = "tpm")]
pub mod pcr;
#[cfg(feature = "tpm")]
pub mod persistent;
#[cfg(feature = "tpm")]
pub mod scoped;
#[cfg(feature = "tpm")]
pub mod sign;
#[cfg(feature = "tpm")]
pub mod signer;
#[cfg(feature = "tpm")]
pub mod tpm;

#[cfg(all(test, feature = "tpm"))]
pub(crate) mod testing;
