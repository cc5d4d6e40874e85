use serde::{Deserialize, Serialize};

use crate::courses::CourseTerms;
use crate::ledger::{Amount, CourseId, Identity, Ledger, LedgerError, Timestamp};
use crate::payout::Payout;

/// A state-changing request together with the identity that submitted it.
/// This is what the journal records and what replay re-executes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    CreateCourse {
        caller: Identity,
        terms: CourseTerms,
    },
    UpdateCourse {
        caller: Identity,
        course_id: CourseId,
        terms: CourseTerms,
        is_active: bool,
    },
    EnrollInCourse {
        caller: Identity,
        course_id: CourseId,
        payment: Amount,
    },
    MarkCourseCompleted {
        caller: Identity,
        learner: Identity,
        course_id: CourseId,
    },
    WithdrawBalance {
        caller: Identity,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    CourseCreated(CourseId),
    Applied,
    Withdrawn(Amount),
}

impl Operation {
    pub fn caller(&self) -> &str {
        match self {
            Operation::CreateCourse { caller, .. }
            | Operation::UpdateCourse { caller, .. }
            | Operation::EnrollInCourse { caller, .. }
            | Operation::MarkCourseCompleted { caller, .. }
            | Operation::WithdrawBalance { caller } => caller,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateCourse { .. } => "create_course",
            Operation::UpdateCourse { .. } => "update_course",
            Operation::EnrollInCourse { .. } => "enroll_in_course",
            Operation::MarkCourseCompleted { .. } => "mark_course_completed",
            Operation::WithdrawBalance { .. } => "withdraw_balance",
        }
    }
}

impl Ledger {
    /// Runs one operation to completion. Either every effect and notification
    /// of the operation is applied or the ledger is left untouched.
    pub fn execute(
        &mut self,
        operation: &Operation,
        now: Timestamp,
        payout: &mut dyn Payout,
    ) -> Result<Outcome, LedgerError> {
        match operation {
            Operation::CreateCourse { caller, terms } => self
                .create_course(caller, terms.clone(), now)
                .map(Outcome::CourseCreated),
            Operation::UpdateCourse {
                caller,
                course_id,
                terms,
                is_active,
            } => self
                .update_course(caller, *course_id, terms.clone(), *is_active, now)
                .map(|()| Outcome::Applied),
            Operation::EnrollInCourse {
                caller,
                course_id,
                payment,
            } => self
                .enroll_in_course(caller, *course_id, *payment, now)
                .map(|()| Outcome::Applied),
            Operation::MarkCourseCompleted {
                caller,
                learner,
                course_id,
            } => self
                .mark_course_completed(caller, learner, *course_id, now, payout)
                .map(|()| Outcome::Applied),
            Operation::WithdrawBalance { caller } => self
                .withdraw_balance(caller, now, payout)
                .map(Outcome::Withdrawn),
        }
    }
}
