//! End-to-end flows through the journal, outbox and replay, the way the
//! `escrow` binary drives them.

use std::fs;

use course_escrow::{
    content::{ContentRef, ContentStore, FsContentStore},
    journal::{read_entries, replay, verify_chain, Journal},
    payout::OutboxPayout,
    CourseTerms, EnrollmentStatus, ErrorKind, Ledger, LedgerEvent, Operation, Outcome,
    TransferReason,
};

const DAY: u64 = 86_400;

fn terms(content_ref: &ContentRef, price: u64, pct: u8, limit: u64) -> CourseTerms {
    CourseTerms {
        title: "Rust for auditors".into(),
        description: "ownership, lifetimes, unsafe".into(),
        content_ref: content_ref.to_string(),
        price,
        completion_time_limit: limit,
        refund_percentage: pct,
    }
}

/// Executes against the ledger and journals whatever committed.
fn submit(
    ledger: &mut Ledger,
    journal: &mut Journal,
    payout: &mut OutboxPayout,
    op: Operation,
    now: u64,
) -> Result<Outcome, course_escrow::LedgerError> {
    let outcome = ledger.execute(&op, now, payout)?;
    journal.record(ledger).unwrap();
    Ok(outcome)
}

#[test]
fn full_lifecycle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsContentStore::open(dir.path().join("content")).unwrap();
    let content = store.put_blob(b"lesson 1: borrowck").unwrap();
    assert_eq!(store.get(&content).unwrap(), b"lesson 1: borrowck");

    let journal_path = dir.path().join("journal.jsonl");
    let outbox_path = dir.path().join("payouts.jsonl");
    let mut journal = Journal::open(&journal_path, None).unwrap();
    let mut payout = OutboxPayout::new(&outbox_path);
    let mut ledger = Ledger::new();

    let t0 = 1_700_000_000;
    let created = submit(
        &mut ledger,
        &mut journal,
        &mut payout,
        Operation::CreateCourse {
            caller: "educator".into(),
            terms: terms(&content, 100, 40, 14 * DAY),
        },
        t0,
    )
    .unwrap();
    assert_eq!(created, Outcome::CourseCreated(0));

    for learner in ["ana", "bo"] {
        submit(
            &mut ledger,
            &mut journal,
            &mut payout,
            Operation::EnrollInCourse {
                caller: learner.into(),
                course_id: 0,
                payment: 100,
            },
            t0 + DAY,
        )
        .unwrap();
    }
    assert_eq!(ledger.balance_of("educator"), 200);

    // ana finishes exactly at the deadline, bo one second after it.
    let deadline = t0 + DAY + 14 * DAY;
    for (learner, at) in [("ana", deadline), ("bo", deadline + 1)] {
        submit(
            &mut ledger,
            &mut journal,
            &mut payout,
            Operation::MarkCourseCompleted {
                caller: "educator".into(),
                learner: learner.into(),
                course_id: 0,
            },
            at,
        )
        .unwrap();
    }
    assert_eq!(
        ledger.enrollment("ana", 0).unwrap().status(),
        EnrollmentStatus::CompletedOnTime
    );
    assert_eq!(
        ledger.enrollment("bo", 0).unwrap().status(),
        EnrollmentStatus::CompletedLate
    );
    assert_eq!(ledger.balance_of("educator"), 160);

    let withdrawn = submit(
        &mut ledger,
        &mut journal,
        &mut payout,
        Operation::WithdrawBalance {
            caller: "educator".into(),
        },
        deadline + 2,
    )
    .unwrap();
    assert_eq!(withdrawn, Outcome::Withdrawn(160));
    assert!(ledger.is_conserved());

    let transfers = OutboxPayout::read_all(&outbox_path).unwrap();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[0].to, "ana");
    assert_eq!(transfers[0].amount, 40);
    assert_eq!(transfers[0].reason, TransferReason::Refund { course_id: 0 });
    assert_eq!(transfers[1].to, "educator");
    assert_eq!(transfers[1].reason, TransferReason::Withdrawal);

    // A fresh process sees the same ledger.
    let entries = read_entries(&journal_path).unwrap();
    assert_eq!(entries.len(), 6);
    verify_chain(&entries, None).unwrap();
    let rebuilt = replay(&entries).unwrap();
    assert_eq!(rebuilt.state_root(), ledger.state_root());
    assert_eq!(rebuilt.snapshot(), ledger.snapshot());
    assert_eq!(rebuilt.balance_of("educator"), 0);
}

#[test]
fn failed_outbox_write_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let mut broken = OutboxPayout::new(blocker.join("payouts.jsonl"));
    let mut working = OutboxPayout::new(dir.path().join("payouts.jsonl"));

    let mut journal = Journal::open(dir.path().join("journal.jsonl"), None).unwrap();
    let mut ledger = Ledger::new();
    let content = ContentRef::for_bytes(b"video");

    submit(
        &mut ledger,
        &mut journal,
        &mut working,
        Operation::CreateCourse {
            caller: "educator".into(),
            terms: terms(&content, 50, 100, DAY),
        },
        10,
    )
    .unwrap();
    submit(
        &mut ledger,
        &mut journal,
        &mut working,
        Operation::EnrollInCourse {
            caller: "ana".into(),
            course_id: 0,
            payment: 50,
        },
        20,
    )
    .unwrap();

    let root = ledger.state_root();
    let height = ledger.height();
    let complete = Operation::MarkCourseCompleted {
        caller: "educator".into(),
        learner: "ana".into(),
        course_id: 0,
    };
    let err = submit(&mut ledger, &mut journal, &mut broken, complete.clone(), 30).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferFailed);
    assert_eq!(ledger.state_root(), root);
    assert_eq!(ledger.height(), height);
    assert_eq!(ledger.enrollment("ana", 0).unwrap().status(), EnrollmentStatus::Enrolled);

    let err = submit(
        &mut ledger,
        &mut journal,
        &mut broken,
        Operation::WithdrawBalance {
            caller: "educator".into(),
        },
        31,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferFailed);
    assert_eq!(ledger.balance_of("educator"), 50);
    assert_eq!(journal.read_all().unwrap().len(), 2);

    // Retrying over a working rail succeeds with the full refund.
    submit(&mut ledger, &mut journal, &mut working, complete, 32).unwrap();
    assert_eq!(ledger.balance_of("educator"), 0);
    let refunds: Vec<_> = ledger
        .events()
        .iter()
        .filter(|r| matches!(r.event, LedgerEvent::RefundProcessed { .. }))
        .collect();
    assert_eq!(refunds.len(), 1);
    assert!(ledger.is_conserved());
}

#[test]
fn rejected_operations_are_not_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = Journal::open(dir.path().join("journal.jsonl"), None).unwrap();
    let mut payout = OutboxPayout::new(dir.path().join("payouts.jsonl"));
    let mut ledger = Ledger::new();
    let content = ContentRef::for_bytes(b"slides");

    submit(
        &mut ledger,
        &mut journal,
        &mut payout,
        Operation::CreateCourse {
            caller: "educator".into(),
            terms: terms(&content, 30, 10, DAY),
        },
        1,
    )
    .unwrap();

    let rejected = [
        Operation::EnrollInCourse {
            caller: "ana".into(),
            course_id: 0,
            payment: 29,
        },
        Operation::EnrollInCourse {
            caller: "ana".into(),
            course_id: 7,
            payment: 30,
        },
        Operation::MarkCourseCompleted {
            caller: "ana".into(),
            learner: "ana".into(),
            course_id: 0,
        },
        Operation::WithdrawBalance {
            caller: "educator".into(),
        },
        Operation::UpdateCourse {
            caller: "educator".into(),
            course_id: 0,
            terms: terms(&content, 30, 101, DAY),
            is_active: true,
        },
    ];
    let kinds: Vec<_> = rejected
        .into_iter()
        .map(|op| submit(&mut ledger, &mut journal, &mut payout, op, 2).unwrap_err().kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            ErrorKind::IncorrectPayment,
            ErrorKind::NotFound,
            ErrorKind::NotOwner,
            ErrorKind::NoBalance,
            ErrorKind::InvalidParameter,
        ]
    );

    let entries = journal.read_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(replay(&entries).unwrap().state_root(), ledger.state_root());
    assert!(OutboxPayout::read_all(payout.path()).unwrap().is_empty());
}
