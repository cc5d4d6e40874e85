//! Durable record of committed operations.
//!
//! The journal is an append-only JSONL file. Every line is one operation that
//! committed against the ledger, hash-chained to its predecessor and
//! optionally signed by the operator key. Replaying the file from the top
//! rebuilds the ledger exactly, because every operation is re-executed at the
//! timestamp it originally ran with.

use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerError, Operation, Timestamp};
use crate::payout::RecordingPayout;

pub mod signing;

pub use signing::{parse_signing_key, parse_verifying_key, EntrySignature};

pub const GENESIS_HASH: &str = "genesis";

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed journal line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("entry {sequence} links to {actual}, expected {expected}")]
    BrokenLink {
        sequence: u64,
        expected: String,
        actual: String,
    },
    #[error("entry {sequence} has hash {actual}, expected {expected}")]
    InvalidHash {
        sequence: u64,
        expected: String,
        actual: String,
    },
    #[error("expected sequence {expected}, found {actual}")]
    InvalidSequence { expected: u64, actual: u64 },
    #[error("entry {sequence} is not signed")]
    MissingSignature { sequence: u64 },
    #[error("entry {sequence} signed by untrusted key {signer}")]
    UntrustedSigner { sequence: u64, signer: String },
    #[error("entry {sequence} carries an invalid signature")]
    InvalidSignature { sequence: u64 },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("replay of entry {sequence} failed: {source}")]
    Replay {
        sequence: u64,
        #[source]
        source: LedgerError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub operation: Operation,
    pub prev_hash: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<EntrySignature>,
}

/// Hash over everything in an entry except the hash and signature.
pub fn entry_hash(
    sequence: u64,
    timestamp: Timestamp,
    prev_hash: &str,
    operation: &Operation,
) -> Result<String, JournalError> {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update((prev_hash.len() as u64).to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(operation)?);
    Ok(hex::encode(hasher.finalize()))
}

pub struct Journal {
    path: PathBuf,
    next_sequence: u64,
    last_hash: String,
    signer: Option<SigningKey>,
}

impl Journal {
    /// Opens (or starts) the journal at `path`, positioning after its last entry.
    pub fn open(
        path: impl Into<PathBuf>,
        signer: Option<SigningKey>,
    ) -> Result<Self, JournalError> {
        let path = path.into();
        let entries = read_entries(&path)?;
        let (next_sequence, last_hash) = match entries.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        debug!(path = %path.display(), entries = entries.len(), "journal opened");
        Ok(Self {
            path,
            next_sequence,
            last_hash,
            signer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<JournalEntry>, JournalError> {
        read_entries(&self.path)
    }

    /// Opens the journal, verifies its chain and rebuilds the ledger from it.
    /// With a signer configured every entry must carry that key's signature.
    pub fn load(
        path: impl Into<PathBuf>,
        signer: Option<SigningKey>,
    ) -> Result<(Self, Ledger), JournalError> {
        let journal = Self::open(path, signer)?;
        let entries = journal.read_all()?;
        let trusted = journal.signer.as_ref().map(SigningKey::verifying_key);
        verify_chain(&entries, trusted.as_ref())?;
        let ledger = replay(&entries)?;
        Ok((journal, ledger))
    }

    /// Appends every operation the ledger committed since it was last drained,
    /// including those committed from inside a payout.
    pub fn record(&mut self, ledger: &mut Ledger) -> Result<Vec<JournalEntry>, JournalError> {
        ledger
            .take_committed()
            .into_iter()
            .map(|committed| self.append(&committed.operation, committed.timestamp))
            .collect()
    }

    /// Records an operation that has already committed against the ledger.
    pub fn append(
        &mut self,
        operation: &Operation,
        timestamp: Timestamp,
    ) -> Result<JournalEntry, JournalError> {
        let sequence = self.next_sequence;
        let hash = entry_hash(sequence, timestamp, &self.last_hash, operation)?;
        let signature = self
            .signer
            .as_ref()
            .map(|key| EntrySignature::sign(key, &hash));
        let entry = JournalEntry {
            sequence,
            timestamp,
            operation: operation.clone(),
            prev_hash: self.last_hash.clone(),
            hash,
            signature,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;

        self.next_sequence += 1;
        self.last_hash = entry.hash.clone();
        debug!(sequence, op = operation.name(), "journal entry appended");
        Ok(entry)
    }
}

/// Reads every entry; a missing file is an empty journal.
pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>, JournalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|source| JournalError::Malformed {
            line: idx + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Checks sequence numbers, hash links and recomputed hashes. When
/// `trusted` is given every entry must carry a valid signature by that key.
pub fn verify_chain(
    entries: &[JournalEntry],
    trusted: Option<&VerifyingKey>,
) -> Result<(), JournalError> {
    let mut expected_sequence = 1;
    let mut prev_hash = GENESIS_HASH.to_string();
    for entry in entries {
        if entry.sequence != expected_sequence {
            return Err(JournalError::InvalidSequence {
                expected: expected_sequence,
                actual: entry.sequence,
            });
        }
        if entry.prev_hash != prev_hash {
            return Err(JournalError::BrokenLink {
                sequence: entry.sequence,
                expected: prev_hash,
                actual: entry.prev_hash.clone(),
            });
        }
        let calculated = entry_hash(
            entry.sequence,
            entry.timestamp,
            &entry.prev_hash,
            &entry.operation,
        )?;
        if entry.hash != calculated {
            return Err(JournalError::InvalidHash {
                sequence: entry.sequence,
                expected: calculated,
                actual: entry.hash.clone(),
            });
        }
        match (&entry.signature, trusted) {
            (Some(signature), trusted) => signature.verify(entry.sequence, &entry.hash, trusted)?,
            (None, Some(_)) => {
                return Err(JournalError::MissingSignature {
                    sequence: entry.sequence,
                })
            }
            (None, None) => {}
        }
        expected_sequence += 1;
        prev_hash = entry.hash.clone();
    }
    Ok(())
}

/// Rebuilds a ledger by re-executing every entry at its recorded time.
/// Transfers are not re-delivered; they already happened when the entry
/// was first committed.
pub fn replay(entries: &[JournalEntry]) -> Result<Ledger, JournalError> {
    let mut ledger = Ledger::new();
    let mut payout = RecordingPayout::new();
    for entry in entries {
        ledger
            .execute(&entry.operation, entry.timestamp, &mut payout)
            .map_err(|source| JournalError::Replay {
                sequence: entry.sequence,
                source,
            })?;
    }
    // already journaled
    ledger.take_committed();
    info!(entries = entries.len(), height = ledger.height(), "journal replayed");
    Ok(ledger)
}
