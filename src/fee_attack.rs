//! Duplicate and fee-attack detection against signing history.
//!
//! A watch wallet that re-submits an already signed payment with a higher
//! fee, or pays the same recipients again from other coins, is caught by
//! comparing the normalized `from`/`to` of the candidate with earlier
//! records of the same coin or wallet.

use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::store::TxRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeAttackVerdict {
    Normal,
    SameOutputs,
    Duplicate { already_signed: bool },
}

impl FeeAttackVerdict {
    pub fn is_normal(self) -> bool {
        self == FeeAttackVerdict::Normal
    }

    /// Blocking only when the user cannot override it.
    pub fn is_hard_block(self) -> bool {
        matches!(self, FeeAttackVerdict::Duplicate { already_signed: true })
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            FeeAttackVerdict::Normal => Ok(()),
            FeeAttackVerdict::SameOutputs => Err(Error::SameOutputsWarning),
            FeeAttackVerdict::Duplicate { already_signed } => {
                Err(Error::DuplicateTransaction { already_signed })
            }
        }
    }
}

/// First historical record that matches decides the verdict.
pub fn check_fee_attack(candidate: &TxRecord, history: &[TxRecord]) -> FeeAttackVerdict {
    let verdict = history
        .iter()
        .find_map(|record| {
            if record.to != candidate.to {
                None
            } else if record.from == candidate.from {
                Some(FeeAttackVerdict::Duplicate {
                    already_signed: record.is_signed(),
                })
            } else {
                Some(FeeAttackVerdict::SameOutputs)
            }
        })
        .unwrap_or(FeeAttackVerdict::Normal);
    if !verdict.is_normal() {
        event!(Level::WARN, ?verdict, history = history.len(), "fee attack check flagged transaction");
    }
    verdict
}
