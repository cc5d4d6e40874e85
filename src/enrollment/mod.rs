//! Payment intake, completion marking and completion refunds.
//!
//! An enrollment moves `Enrolled -> CompletedOnTime | CompletedLate` exactly
//! once. Deadline and refund terms are captured when the learner pays, so a
//! later course update never changes what an existing enrollment is owed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::{
    Amount, CourseId, Identity, Ledger, LedgerError, LedgerEvent, Operation, Timestamp,
};
use crate::payout::{Payout, Transfer, TransferReason};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enrollment {
    pub learner: Identity,
    pub course_id: CourseId,
    pub enrollment_time: Timestamp,
    pub completion_deadline: Timestamp,
    pub amount_paid: Amount,
    pub refund_percentage: u8,
    pub is_completed: bool,
    pub is_refunded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    CompletedOnTime,
    CompletedLate,
}

impl Enrollment {
    pub fn status(&self) -> EnrollmentStatus {
        match (self.is_completed, self.is_refunded) {
            (false, _) => EnrollmentStatus::Enrolled,
            (true, true) => EnrollmentStatus::CompletedOnTime,
            (true, false) => EnrollmentStatus::CompletedLate,
        }
    }

    /// Inclusive: completing exactly at the deadline still qualifies.
    pub fn is_within_deadline(&self, now: Timestamp) -> bool {
        now <= self.completion_deadline
    }

    pub fn refund_amount(&self) -> Amount {
        refund_amount(self.amount_paid, self.refund_percentage)
    }
}

/// `floor(price * percentage / 100)`; never exceeds `price` for percentages up to 100.
pub fn refund_amount(price: Amount, refund_percentage: u8) -> Amount {
    (price as u128 * refund_percentage as u128 / 100) as Amount
}

impl Ledger {
    pub fn enroll_in_course(
        &mut self,
        caller: &str,
        course_id: CourseId,
        payment: Amount,
        now: Timestamp,
    ) -> Result<(), LedgerError> {
        let course = self.course(course_id)?;
        if !course.is_active {
            return Err(LedgerError::InactiveCourse { course_id });
        }
        if self.enrollment(caller, course_id).is_ok() {
            debug!(learner = caller, course_id, "enroll rejected: already enrolled");
            return Err(LedgerError::AlreadyEnrolled {
                learner: caller.to_owned(),
                course_id,
            });
        }
        if payment != course.price {
            debug!(learner = caller, course_id, payment, "enroll rejected: wrong payment");
            return Err(LedgerError::IncorrectPayment {
                expected: course.price,
                received: payment,
            });
        }
        let completion_deadline = now
            .checked_add(course.completion_time_limit)
            .ok_or(LedgerError::Overflow("completion deadline"))?;
        let payments_received = self
            .totals
            .payments_received
            .checked_add(payment)
            .ok_or(LedgerError::Overflow("payments received"))?;
        let educator = course.educator.clone();
        let refund_percentage = course.refund_percentage;

        // credit first: it is the only effect that can still fail
        self.credit(&educator, payment)?;
        self.totals.payments_received = payments_received;
        self.enrollments.entry(caller.to_owned()).or_default().insert(
            course_id,
            Enrollment {
                learner: caller.to_owned(),
                course_id,
                enrollment_time: now,
                completion_deadline,
                amount_paid: payment,
                refund_percentage,
                is_completed: false,
                is_refunded: false,
            },
        );
        self.enrollments_by_learner
            .entry(caller.to_owned())
            .or_default()
            .push(course_id);

        info!(course_id, learner = caller, %educator, payment, completion_deadline, "enrolled");
        self.commit(
            now,
            Operation::EnrollInCourse {
                caller: caller.to_owned(),
                course_id,
                payment,
            },
            vec![LedgerEvent::CourseEnrolled {
                course_id,
                learner: caller.to_owned(),
                amount: payment,
                completion_deadline,
            }],
        );
        Ok(())
    }

    /// Marks a learner's enrollment complete and, when completion lands on or
    /// before the deadline, refunds the enrollment's share to the learner out of
    /// the educator balance.
    ///
    /// Flags, the balance debit and the notifications are committed before
    /// `payout` runs. If the payout fails the ledger returns to where it was
    /// before this call, including anything committed from inside the payout.
    pub fn mark_course_completed(
        &mut self,
        caller: &str,
        learner: &str,
        course_id: CourseId,
        now: Timestamp,
        payout: &mut dyn Payout,
    ) -> Result<(), LedgerError> {
        let educator = self.course(course_id)?.educator.clone();
        if educator != caller {
            debug!(caller, course_id, "complete rejected: not owner");
            return Err(LedgerError::NotOwner {
                caller: caller.to_owned(),
                course_id,
            });
        }
        let enrollment = self.enrollment(learner, course_id)?;
        if enrollment.is_completed {
            return Err(LedgerError::AlreadyCompleted {
                learner: learner.to_owned(),
                course_id,
            });
        }
        let on_time = enrollment.is_within_deadline(now) && !enrollment.is_refunded;
        let refund = if on_time { enrollment.refund_amount() } else { 0 };
        let refunds_paid = self
            .totals
            .refunds_paid
            .checked_add(refund)
            .ok_or(LedgerError::Overflow("refunds paid"))?;
        let available = self.balance_of(&educator);
        if refund > available {
            debug!(
                course_id,
                learner,
                refund,
                available,
                "complete rejected: educator balance short"
            );
            return Err(LedgerError::InsufficientBalance {
                educator,
                required: refund,
                available,
            });
        }

        let operation = Operation::MarkCourseCompleted {
            caller: caller.to_owned(),
            learner: learner.to_owned(),
            course_id,
        };
        let mut events = vec![LedgerEvent::CourseCompleted {
            course_id,
            learner: learner.to_owned(),
            on_time,
        }];
        if refund == 0 {
            self.set_completion_flags(learner, course_id, on_time);
            info!(course_id, learner, on_time, "course completed");
            self.commit(now, operation, events);
            return Ok(());
        }

        let checkpoint = self.checkpoint();
        self.debit(&educator, refund)?;
        self.totals.refunds_paid = refunds_paid;
        self.set_completion_flags(learner, course_id, true);
        events.push(LedgerEvent::RefundProcessed {
            course_id,
            learner: learner.to_owned(),
            amount: refund,
        });
        info!(course_id, learner, refund, "course completed on time");
        let transfer = Transfer {
            to: learner.to_owned(),
            amount: refund,
            reason: TransferReason::Refund { course_id },
        };
        self.commit_then_deliver(checkpoint, now, operation, events, transfer, payout)
    }

    pub fn enrollment(
        &self,
        learner: &str,
        course_id: CourseId,
    ) -> Result<&Enrollment, LedgerError> {
        self.enrollments
            .get(learner)
            .and_then(|by_course| by_course.get(&course_id))
            .ok_or_else(|| LedgerError::UnknownEnrollment {
                learner: learner.to_owned(),
                course_id,
            })
    }

    pub fn learner_enrollments(&self, learner: &str) -> &[CourseId] {
        self.enrollments_by_learner
            .get(learner)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn set_completion_flags(&mut self, learner: &str, course_id: CourseId, refunded: bool) {
        if let Some(enrollment) = self
            .enrollments
            .get_mut(learner)
            .and_then(|by_course| by_course.get_mut(&course_id))
        {
            enrollment.is_completed = true;
            enrollment.is_refunded = refunded;
        }
    }
}
