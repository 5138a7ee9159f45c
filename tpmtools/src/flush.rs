// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use crate::{
    device::{HandleClass, TpmDevice},
    tpm::TpmError,
};
use log::*;
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandleCategoryError {
    #[error("Unknown handle category '{0}', expected one of: transient, loaded, saved, all")]
    Unknown(String),
}

/// Handles to release before the tools start using the TPM
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleCategory {
    Transient,
    Loaded,
    Saved,
    All,
}

impl HandleCategory {
    /// Handle classes to flush, in order
    pub fn classes(&self) -> &'static [HandleClass] {
        match self {
            HandleCategory::Transient => &[HandleClass::Transient],
            HandleCategory::Loaded => &[HandleClass::LoadedSession],
            HandleCategory::Saved => &[HandleClass::SavedSession],
            HandleCategory::All => &[
                HandleClass::LoadedSession,
                HandleClass::SavedSession,
                HandleClass::Transient,
            ],
        }
    }
}

impl FromStr for HandleCategory {
    type Err = HandleCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(HandleCategory::Transient),
            "loaded" => Ok(HandleCategory::Loaded),
            "saved" => Ok(HandleCategory::Saved),
            "all" => Ok(HandleCategory::All),
            other => Err(HandleCategoryError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for HandleCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let value = match self {
            HandleCategory::Transient => "transient",
            HandleCategory::Loaded => "loaded",
            HandleCategory::Saved => "saved",
            HandleCategory::All => "all",
        };
        write!(f, "{value}")
    }
}

/// Flushes every handle of `category` resident in the TPM.
///
/// Returns the number of flushed handles. The first handle that cannot be
/// flushed aborts the operation.
pub fn flush_handles<D: TpmDevice>(
    device: &mut D,
    category: HandleCategory,
) -> Result<usize, TpmError> {
    let mut total = 0;

    for class in category.classes() {
        let handles = device
            .handles(*class)
            .map_err(|source| TpmError::TSSGetCapability {
                class: *class,
                source,
            })?;

        for handle in handles {
            device
                .flush_handle(handle)
                .map_err(|source| TpmError::TSSFlushHandle { handle, source })?;
            info!("Handle {handle:#x} flushed");
            total += 1;
        }
    }

    info!("{total} {category} handle(s) flushed");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTpm;

    #[test]
    fn test_parse_category() {
        assert_eq!("transient".parse(), Ok(HandleCategory::Transient));
        assert_eq!("loaded".parse(), Ok(HandleCategory::Loaded));
        assert_eq!("saved".parse(), Ok(HandleCategory::Saved));
        assert_eq!("all".parse(), Ok(HandleCategory::All));
        assert_eq!(
            "All".parse::<HandleCategory>(),
            Err(HandleCategoryError::Unknown("All".to_string()))
        );
        assert!("".parse::<HandleCategory>().is_err());
    }

    #[test]
    fn test_flush_transient() {
        let mut tpm = MockTpm::new();
        tpm.add_stale_handles(&[0x8000_0000, 0x8000_0001, 0x0200_0000]);

        let n = flush_handles(&mut tpm, HandleCategory::Transient).unwrap(); //#[allow_ci]
        assert_eq!(n, 2);
        assert!(tpm.handles(HandleClass::Transient).unwrap().is_empty()); //#[allow_ci]
        assert_eq!(
            tpm.handles(HandleClass::LoadedSession).unwrap(), //#[allow_ci]
            vec![0x0200_0000]
        );
    }

    #[test]
    fn test_flush_all_twice() {
        let mut tpm = MockTpm::new();
        tpm.add_stale_handles(&[0x8000_0002, 0x0200_0001, 0x0300_0004]);

        let n = flush_handles(&mut tpm, HandleCategory::All).unwrap(); //#[allow_ci]
        assert_eq!(n, 3);
        for class in HandleCategory::All.classes() {
            assert!(tpm.handles(*class).unwrap().is_empty()); //#[allow_ci]
        }

        let n = flush_handles(&mut tpm, HandleCategory::All).unwrap(); //#[allow_ci]
        assert_eq!(n, 0);
    }

    #[test]
    fn test_flush_failure_names_handle() {
        let mut tpm = MockTpm::new();
        tpm.add_stale_handles(&[0x0300_0001]);
        tpm.fail_on("flush_handle");

        let r = flush_handles(&mut tpm, HandleCategory::Saved);
        assert!(matches!(
            r,
            Err(TpmError::TSSFlushHandle {
                handle: 0x0300_0001,
                ..
            })
        ));
    }
}
