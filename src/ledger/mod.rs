use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::courses::Course;
use crate::enrollment::Enrollment;
use crate::payout::{Payout, Transfer};

pub mod operation;
pub mod shared;

pub use operation::{Operation, Outcome};
pub use shared::SharedLedger;

pub type Identity = String;
pub type CourseId = u64;
pub type Amount = u64;
/// Unix seconds, always supplied by the caller.
pub type Timestamp = u64;
pub type Seconds = u64;

/// Coarse classification of a rejected operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    NotOwner,
    AlreadyEnrolled,
    AlreadyCompleted,
    IncorrectPayment,
    InsufficientBalance,
    NoBalance,
    TransferFailed,
    Overflow,
    Reentrant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown course {course_id}")]
    UnknownCourse { course_id: CourseId },
    #[error("course {course_id} is not accepting enrollments")]
    InactiveCourse { course_id: CourseId },
    #[error("{learner} is not enrolled in course {course_id}")]
    UnknownEnrollment { learner: Identity, course_id: CourseId },
    #[error("{caller} does not own course {course_id}")]
    NotOwner { caller: Identity, course_id: CourseId },
    #[error("{learner} is already enrolled in course {course_id}")]
    AlreadyEnrolled { learner: Identity, course_id: CourseId },
    #[error("{learner} has already completed course {course_id}")]
    AlreadyCompleted { learner: Identity, course_id: CourseId },
    #[error("payment of {received} does not match price {expected}")]
    IncorrectPayment { expected: Amount, received: Amount },
    #[error("balance of {educator} is {available}, {required} required")]
    InsufficientBalance {
        educator: Identity,
        required: Amount,
        available: Amount,
    },
    #[error("{educator} has no balance to withdraw")]
    NoBalance { educator: Identity },
    #[error("transfer of {amount} to {to} failed: {reason}")]
    TransferFailed {
        to: Identity,
        amount: Amount,
        reason: String,
    },
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
    #[error("shared ledger handle used from inside its own payout")]
    Reentrant,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            LedgerError::UnknownCourse { .. }
            | LedgerError::InactiveCourse { .. }
            | LedgerError::UnknownEnrollment { .. } => ErrorKind::NotFound,
            LedgerError::NotOwner { .. } => ErrorKind::NotOwner,
            LedgerError::AlreadyEnrolled { .. } => ErrorKind::AlreadyEnrolled,
            LedgerError::AlreadyCompleted { .. } => ErrorKind::AlreadyCompleted,
            LedgerError::IncorrectPayment { .. } => ErrorKind::IncorrectPayment,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::NoBalance { .. } => ErrorKind::NoBalance,
            LedgerError::TransferFailed { .. } => ErrorKind::TransferFailed,
            LedgerError::Overflow(_) => ErrorKind::Overflow,
            LedgerError::Reentrant => ErrorKind::Reentrant,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    CourseCreated {
        course_id: CourseId,
        educator: Identity,
        price: Amount,
    },
    CourseUpdated {
        course_id: CourseId,
        is_active: bool,
    },
    CourseEnrolled {
        course_id: CourseId,
        learner: Identity,
        amount: Amount,
        completion_deadline: Timestamp,
    },
    CourseCompleted {
        course_id: CourseId,
        learner: Identity,
        on_time: bool,
    },
    RefundProcessed {
        course_id: CourseId,
        learner: Identity,
        amount: Amount,
    },
    BalanceWithdrawn {
        educator: Identity,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub event: LedgerEvent,
}

/// Running sums backing the conservation check.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Totals {
    pub payments_received: Amount,
    pub refunds_paid: Amount,
    pub withdrawals_paid: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerMeta {
    /// Committed state-changing operations.
    pub height: u64,
    pub last_timestamp: Timestamp,
    pub next_course_id: CourseId,
    pub next_event_sequence: u64,
}

/// An operation as it committed. Operations started from inside a payout
/// commit after the operation that issued the transfer, so replaying this
/// log in order rebuilds the same state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommittedOperation {
    pub operation: Operation,
    pub timestamp: Timestamp,
}

/// State captured before an operation that hands a transfer to a payout.
pub(crate) struct Checkpoint {
    meta: LedgerMeta,
    courses: BTreeMap<CourseId, Course>,
    enrollments: BTreeMap<Identity, BTreeMap<CourseId, Enrollment>>,
    balances: BTreeMap<Identity, Amount>,
    courses_by_educator: BTreeMap<Identity, Vec<CourseId>>,
    enrollments_by_learner: BTreeMap<Identity, Vec<CourseId>>,
    totals: Totals,
    events_len: usize,
    committed_len: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: LedgerMeta,
    pub courses: Vec<Course>,
    pub enrollments: Vec<Enrollment>,
    pub balances: BTreeMap<Identity, Amount>,
    pub totals: Totals,
    pub events: Vec<EventRecord>,
    pub state_root: String,
}

/// The escrow ledger. Owns every course, enrollment and balance; callers only
/// reach state through the operations implemented across `courses`,
/// `enrollment` and `balance`.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    pub(crate) meta: LedgerMeta,
    pub(crate) courses: BTreeMap<CourseId, Course>,
    pub(crate) enrollments: BTreeMap<Identity, BTreeMap<CourseId, Enrollment>>,
    pub(crate) balances: BTreeMap<Identity, Amount>,
    pub(crate) courses_by_educator: BTreeMap<Identity, Vec<CourseId>>,
    pub(crate) enrollments_by_learner: BTreeMap<Identity, Vec<CourseId>>,
    pub(crate) totals: Totals,
    pub(crate) events: Vec<EventRecord>,
    pub(crate) committed: Vec<CommittedOperation>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> u64 {
        self.meta.height
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// Sum of every educator balance. Widened so the check itself cannot overflow.
    pub fn total_balances(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }

    /// `Σ balances + refunds paid + withdrawals paid == payments received`.
    pub fn is_conserved(&self) -> bool {
        let outflow = self.totals.refunds_paid as u128 + self.totals.withdrawals_paid as u128;
        self.total_balances() + outflow == self.totals.payments_received as u128
    }

    /// Adds to an educator balance, failing without side effects on overflow.
    pub(crate) fn credit(&mut self, educator: &str, amount: Amount) -> Result<(), LedgerError> {
        let current = self.balances.get(educator).copied().unwrap_or(0);
        let next = current
            .checked_add(amount)
            .ok_or(LedgerError::Overflow("educator balance"))?;
        self.balances.insert(educator.to_owned(), next);
        Ok(())
    }

    /// Subtracts from an educator balance, refusing to go below zero.
    pub(crate) fn debit(&mut self, educator: &str, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balances.get(educator).copied().unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                educator: educator.to_owned(),
                required: amount,
                available,
            });
        }
        self.balances.insert(educator.to_owned(), available - amount);
        Ok(())
    }

    /// Operations committed since the last [`Ledger::take_committed`],
    /// nested ones included.
    pub fn committed(&self) -> &[CommittedOperation] {
        &self.committed
    }

    /// Drains the committed-operation log. Callers that journal the ledger
    /// call this after every top-level operation.
    pub fn take_committed(&mut self) -> Vec<CommittedOperation> {
        std::mem::take(&mut self.committed)
    }

    /// Makes an operation's effects final: bumps the height, logs the
    /// operation and appends its notifications in the order the effects were
    /// applied.
    pub(crate) fn commit(
        &mut self,
        now: Timestamp,
        operation: Operation,
        events: Vec<LedgerEvent>,
    ) {
        self.meta.height += 1;
        self.meta.last_timestamp = now;
        for event in events {
            let sequence = self.meta.next_event_sequence;
            self.meta.next_event_sequence += 1;
            debug!(sequence, ?event, "ledger event");
            self.events.push(EventRecord {
                sequence,
                timestamp: now,
                event,
            });
        }
        self.committed.push(CommittedOperation {
            operation,
            timestamp: now,
        });
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            meta: self.meta.clone(),
            courses: self.courses.clone(),
            enrollments: self.enrollments.clone(),
            balances: self.balances.clone(),
            courses_by_educator: self.courses_by_educator.clone(),
            enrollments_by_learner: self.enrollments_by_learner.clone(),
            totals: self.totals,
            events_len: self.events.len(),
            committed_len: self.committed.len(),
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.meta = checkpoint.meta;
        self.courses = checkpoint.courses;
        self.enrollments = checkpoint.enrollments;
        self.balances = checkpoint.balances;
        self.courses_by_educator = checkpoint.courses_by_educator;
        self.enrollments_by_learner = checkpoint.enrollments_by_learner;
        self.totals = checkpoint.totals;
        self.events.truncate(checkpoint.events_len);
        self.committed.truncate(checkpoint.committed_len);
    }

    /// Commits `operation`, then hands `transfer` to `payout`. Anything the
    /// payout does to the ledger happens after the commit. If delivery fails
    /// the ledger goes back to `checkpoint`, which also discards operations
    /// committed from inside the payout.
    pub(crate) fn commit_then_deliver(
        &mut self,
        checkpoint: Checkpoint,
        now: Timestamp,
        operation: Operation,
        events: Vec<LedgerEvent>,
        transfer: Transfer,
        payout: &mut dyn Payout,
    ) -> Result<(), LedgerError> {
        let name = operation.name();
        self.commit(now, operation, events);
        if let Err(err) = payout.deliver(self, &transfer) {
            warn!(
                op = name,
                to = %transfer.to,
                amount = transfer.amount,
                %err,
                "transfer failed, rolling back"
            );
            self.restore(checkpoint);
            return Err(LedgerError::TransferFailed {
                to: transfer.to,
                amount: transfer.amount,
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            courses: self.courses.values().cloned().collect(),
            enrollments: self
                .enrollments
                .values()
                .flat_map(|by_course| by_course.values().cloned())
                .collect(),
            balances: self.balances.clone(),
            totals: self.totals,
            events: self.events.clone(),
            state_root: hex::encode(self.state_root()),
        }
    }

    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for course in self.courses.values() {
            let mut hasher = Sha256::new();
            hasher.update(b"course");
            hasher.update(course.id.to_le_bytes());
            update_str(&mut hasher, &course.educator);
            update_str(&mut hasher, &course.title);
            update_str(&mut hasher, &course.description);
            update_str(&mut hasher, &course.content_ref);
            hasher.update(course.price.to_le_bytes());
            hasher.update(course.completion_time_limit.to_le_bytes());
            hasher.update([course.refund_percentage, course.is_active as u8]);
            leaves.push(hasher.finalize().into());
        }
        for enrollment in self.enrollments.values().flat_map(|m| m.values()) {
            let mut hasher = Sha256::new();
            hasher.update(b"enrollment");
            update_str(&mut hasher, &enrollment.learner);
            hasher.update(enrollment.course_id.to_le_bytes());
            hasher.update(enrollment.enrollment_time.to_le_bytes());
            hasher.update(enrollment.completion_deadline.to_le_bytes());
            hasher.update(enrollment.amount_paid.to_le_bytes());
            hasher.update([
                enrollment.refund_percentage,
                enrollment.is_completed as u8,
                enrollment.is_refunded as u8,
            ]);
            leaves.push(hasher.finalize().into());
        }
        for (educator, balance) in &self.balances {
            let mut hasher = Sha256::new();
            hasher.update(b"balance");
            update_str(&mut hasher, educator);
            hasher.update(balance.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }
}

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"course-escrow-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
