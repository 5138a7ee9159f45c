// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use log::*;
use std::fmt;
use tss_esapi::{
    interface_types::algorithm::HashingAlgorithm,
    structures::{PcrSelectionList, PcrSelectionListBuilder, PcrSlot},
};

/// Highest PCR index a key can be bound to
pub const MAX_PCR_INDEX: u8 = 23;

/// Index of a PCR in the SHA-256 bank, always in `0..=23`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PcrIndex(u8);

impl PcrIndex {
    pub fn new(index: u8) -> Option<Self> {
        if index <= MAX_PCR_INDEX {
            Some(PcrIndex(index))
        } else {
            None
        }
    }

    /// Interprets the `--bind-pcr-value` option.
    ///
    /// Negative values disable PCR binding. Values above 23 also disable it,
    /// with a warning.
    pub fn from_flag(value: i64) -> Option<Self> {
        if value < 0 {
            return None;
        }

        let index = u8::try_from(value).ok().and_then(PcrIndex::new);
        if index.is_none() {
            warn!(
                "PCR {value} is outside of 0-{MAX_PCR_INDEX}, key will not be bound to a PCR"
            );
        }
        index
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    pub fn slot(&self) -> PcrSlot {
        match self.0 {
            0 => PcrSlot::Slot0,
            1 => PcrSlot::Slot1,
            2 => PcrSlot::Slot2,
            3 => PcrSlot::Slot3,
            4 => PcrSlot::Slot4,
            5 => PcrSlot::Slot5,
            6 => PcrSlot::Slot6,
            7 => PcrSlot::Slot7,
            8 => PcrSlot::Slot8,
            9 => PcrSlot::Slot9,
            10 => PcrSlot::Slot10,
            11 => PcrSlot::Slot11,
            12 => PcrSlot::Slot12,
            13 => PcrSlot::Slot13,
            14 => PcrSlot::Slot14,
            15 => PcrSlot::Slot15,
            16 => PcrSlot::Slot16,
            17 => PcrSlot::Slot17,
            18 => PcrSlot::Slot18,
            19 => PcrSlot::Slot19,
            20 => PcrSlot::Slot20,
            21 => PcrSlot::Slot21,
            22 => PcrSlot::Slot22,
            _ => PcrSlot::Slot23,
        }
    }

    /// Selection of this PCR in the SHA-256 bank
    pub fn selection(&self) -> tss_esapi::Result<PcrSelectionList> {
        PcrSelectionListBuilder::new()
            .with_selection(HashingAlgorithm::Sha256, &[self.slot()])
            .build()
    }
}

impl fmt::Display for PcrIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
