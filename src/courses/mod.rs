//! Course registry: listings owned by the educator who created them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::{
    Amount, CourseId, Identity, Ledger, LedgerError, LedgerEvent, Operation, Seconds, Timestamp,
};

pub const MAX_REFUND_PERCENTAGE: u8 = 100;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Course {
    pub id: CourseId,
    /// Fixed at creation.
    pub educator: Identity,
    pub title: String,
    pub description: String,
    /// Content identifier issued by the content store; never the content itself.
    pub content_ref: String,
    pub price: Amount,
    pub completion_time_limit: Seconds,
    pub refund_percentage: u8,
    pub is_active: bool,
}

/// The educator-controlled fields of a listing, as submitted on create and update.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CourseTerms {
    pub title: String,
    pub description: String,
    pub content_ref: String,
    pub price: Amount,
    pub completion_time_limit: Seconds,
    pub refund_percentage: u8,
}

impl CourseTerms {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.refund_percentage > MAX_REFUND_PERCENTAGE {
            return Err(LedgerError::InvalidParameter(format!(
                "refund percentage {} exceeds {MAX_REFUND_PERCENTAGE}",
                self.refund_percentage
            )));
        }
        Ok(())
    }
}

impl Ledger {
    pub fn create_course(
        &mut self,
        caller: &str,
        terms: CourseTerms,
        now: Timestamp,
    ) -> Result<CourseId, LedgerError> {
        if let Err(err) = terms.validate() {
            debug!(caller, %err, "create_course rejected");
            return Err(err);
        }
        let course_id = self.meta.next_course_id;
        let next_id = course_id
            .checked_add(1)
            .ok_or(LedgerError::Overflow("course id"))?;

        let operation = Operation::CreateCourse {
            caller: caller.to_owned(),
            terms: terms.clone(),
        };
        self.meta.next_course_id = next_id;
        let price = terms.price;
        self.courses.insert(
            course_id,
            Course {
                id: course_id,
                educator: caller.to_owned(),
                title: terms.title,
                description: terms.description,
                content_ref: terms.content_ref,
                price,
                completion_time_limit: terms.completion_time_limit,
                refund_percentage: terms.refund_percentage,
                is_active: true,
            },
        );
        self.courses_by_educator
            .entry(caller.to_owned())
            .or_default()
            .push(course_id);

        info!(course_id, educator = caller, price, "course created");
        self.commit(
            now,
            operation,
            vec![LedgerEvent::CourseCreated {
                course_id,
                educator: caller.to_owned(),
                price,
            }],
        );
        Ok(course_id)
    }

    /// Overwrites every mutable field of a listing. Existing enrollments keep
    /// the deadline and refund terms they were enrolled under.
    pub fn update_course(
        &mut self,
        caller: &str,
        course_id: CourseId,
        terms: CourseTerms,
        is_active: bool,
        now: Timestamp,
    ) -> Result<(), LedgerError> {
        let course = self
            .courses
            .get_mut(&course_id)
            .ok_or(LedgerError::UnknownCourse { course_id })?;
        if course.educator != caller {
            debug!(caller, course_id, "update_course rejected: not owner");
            return Err(LedgerError::NotOwner {
                caller: caller.to_owned(),
                course_id,
            });
        }
        terms.validate()?;
        let operation = Operation::UpdateCourse {
            caller: caller.to_owned(),
            course_id,
            terms: terms.clone(),
            is_active,
        };

        course.title = terms.title;
        course.description = terms.description;
        course.content_ref = terms.content_ref;
        course.price = terms.price;
        course.completion_time_limit = terms.completion_time_limit;
        course.refund_percentage = terms.refund_percentage;
        course.is_active = is_active;

        info!(course_id, is_active, "course updated");
        self.commit(
            now,
            operation,
            vec![LedgerEvent::CourseUpdated {
                course_id,
                is_active,
            }],
        );
        Ok(())
    }

    pub fn course(&self, course_id: CourseId) -> Result<&Course, LedgerError> {
        self.courses
            .get(&course_id)
            .ok_or(LedgerError::UnknownCourse { course_id })
    }

    pub fn courses_by_educator(&self, educator: &str) -> &[CourseId] {
        self.courses_by_educator
            .get(educator)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of course ids allocated so far; ids are `0..course_count()`.
    pub fn course_count(&self) -> u64 {
        self.meta.next_course_id
    }

    /// Page through listings in id order.
    pub fn courses(&self, offset: usize, limit: usize) -> Vec<&Course> {
        self.courses.values().skip(offset).take(limit).collect()
    }
}
