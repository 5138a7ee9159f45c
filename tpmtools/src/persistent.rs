// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use std::{fmt, num::ParseIntError, str::FromStr};
use thiserror::Error;

/// First address available for the imported signing keys
pub const PERSISTENT_HANDLE_FIRST: u32 = 0x8100_8000;
/// Last address available for the imported signing keys
pub const PERSISTENT_HANDLE_LAST: u32 = 0x8100_FFFF;
/// Address used when none is configured
pub const DEFAULT_PERSISTENT_HANDLE: u32 = PERSISTENT_HANDLE_FIRST;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PersistentHandleError {
    #[error("persistent handle {0:#x} is outside of the range {PERSISTENT_HANDLE_FIRST:#x}-{PERSISTENT_HANDLE_LAST:#x}")]
    OutOfRange(u32),

    #[error("failed to parse persistent handle '{origin}'")]
    NumParse {
        origin: String,
        source: ParseIntError,
    },
}

/// A persistent TPM address in `0x81008000..=0x8100FFFF`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for PersistentHandle {
    fn default() -> Self {
        PersistentHandle(DEFAULT_PERSISTENT_HANDLE)
    }
}

impl TryFrom<u32> for PersistentHandle {
    type Error = PersistentHandleError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if (PERSISTENT_HANDLE_FIRST..=PERSISTENT_HANDLE_LAST).contains(&value)
        {
            Ok(PersistentHandle(value))
        } else {
            Err(PersistentHandleError::OutOfRange(value))
        }
    }
}

impl FromStr for PersistentHandle {
    type Err = PersistentHandleError;

    /// Accepts both hexadecimal (`0x81008000`) and decimal values
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => trimmed.parse::<u32>(),
        };

        let value =
            parsed.map_err(|source| PersistentHandleError::NumParse {
                origin: s.to_string(),
                source,
            })?;
        PersistentHandle::try_from(value)
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
