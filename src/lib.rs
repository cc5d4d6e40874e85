//! Escrow and completion-refund ledger for paid courses.
//!
//! Educators list courses, learners pay the full price up front, and a share
//! of that price is refunded when the educator marks the course complete on or
//! before the learner's deadline. The crate is organised around one
//! [`Ledger`] value that owns all state:
//!
//! * [`courses`]: listing creation, updates and queries.
//! * [`enrollment`]: payment intake, completion and refunds.
//! * [`balance`]: educator earnings and withdrawal.
//! * [`payout`]: the seam through which refunds and withdrawals leave the ledger.
//! * [`journal`]: hash-chained JSONL record of committed operations, and replay.
//! * [`content`]: content addressing for course material stored off-ledger.
//! * [`config`]: layered runtime configuration for the `escrow` binary.

pub mod balance;
pub mod config;
pub mod content;
pub mod courses;
pub mod enrollment;
pub mod journal;
pub mod ledger;
pub mod payout;

pub use courses::{Course, CourseTerms};
pub use enrollment::{Enrollment, EnrollmentStatus};
pub use ledger::{
    Amount, CommittedOperation, CourseId, ErrorKind, Identity, Ledger, LedgerError, LedgerEvent,
    Operation, Outcome, SharedLedger, Timestamp,
};
pub use payout::{Payout, PayoutError, RecordingPayout, Transfer, TransferReason};
