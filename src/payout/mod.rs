//! Outbound transfers. The ledger never moves money itself; it hands each
//! refund or withdrawal to a [`Payout`] once its own books already reflect it.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::ledger::{Amount, CourseId, Identity, Ledger};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferReason {
    Refund { course_id: CourseId },
    Withdrawal,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transfer {
    pub to: Identity,
    pub amount: Amount,
    pub reason: TransferReason,
}

#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    #[error("payout rejected: {0}")]
    Rejected(String),
    #[error("outbox write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("outbox encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Delivers a transfer. Receives the ledger so a collaborator may call back
/// into it; any such call sees the operation that issued the transfer
/// already committed, and is undone with it if delivery fails.
///
/// Call back only through the `&mut Ledger` passed in. A
/// [`SharedLedger`](crate::SharedLedger) handle to the same ledger is locked
/// for the duration of `deliver` and rejects use with `LedgerError::Reentrant`.
pub trait Payout {
    fn deliver(&mut self, ledger: &mut Ledger, transfer: &Transfer) -> Result<(), PayoutError>;
}

impl<F> Payout for F
where
    F: FnMut(&mut Ledger, &Transfer) -> Result<(), PayoutError>,
{
    fn deliver(&mut self, ledger: &mut Ledger, transfer: &Transfer) -> Result<(), PayoutError> {
        self(ledger, transfer)
    }
}

/// Accepts every transfer and keeps it in memory. Used for replay and tests.
#[derive(Clone, Debug, Default)]
pub struct RecordingPayout {
    delivered: Vec<Transfer>,
}

impl RecordingPayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> &[Transfer] {
        &self.delivered
    }

    pub fn total(&self) -> u128 {
        self.delivered.iter().map(|t| t.amount as u128).sum()
    }
}

impl Payout for RecordingPayout {
    fn deliver(&mut self, _ledger: &mut Ledger, transfer: &Transfer) -> Result<(), PayoutError> {
        self.delivered.push(transfer.clone());
        Ok(())
    }
}

/// Appends each transfer as one JSON line to an outbox file that an external
/// payment rail drains. A write failure fails the transfer.
pub struct OutboxPayout {
    path: PathBuf,
}

impl OutboxPayout {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(path: &Path) -> Result<Vec<Transfer>, PayoutError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PayoutError::from))
            .collect()
    }
}

impl Payout for OutboxPayout {
    fn deliver(&mut self, _ledger: &mut Ledger, transfer: &Transfer) -> Result<(), PayoutError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(transfer)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
