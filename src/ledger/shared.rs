use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ledger::{CommittedOperation, Ledger, LedgerError, Operation, Outcome, Timestamp};
use crate::payout::Payout;

thread_local! {
    /// Ledgers whose lock this thread currently holds, by `Arc` address.
    static HELD: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

struct HeldGuard(usize);

impl HeldGuard {
    fn enter(id: usize) -> Result<Self, LedgerError> {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if held.contains(&id) {
                return Err(LedgerError::Reentrant);
            }
            held.push(id);
            Ok(Self(id))
        })
    }
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        HELD.with(|held| held.borrow_mut().retain(|id| *id != self.0));
    }
}

/// Cloneable handle that serializes operations from many threads into one
/// total order. A payout invoked under the lock re-enters through the
/// `&mut Ledger` it is handed; going through this handle from inside that
/// payout fails with [`LedgerError::Reentrant`] instead of blocking.
#[derive(Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<Ledger>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> Result<R, LedgerError> {
        let _held = HeldGuard::enter(Arc::as_ptr(&self.inner) as usize)?;
        let mut ledger = self.inner.lock();
        Ok(f(&mut ledger))
    }

    pub fn execute(
        &self,
        operation: &Operation,
        now: Timestamp,
        payout: &mut dyn Payout,
    ) -> Result<Outcome, LedgerError> {
        self.with_lock(|ledger| ledger.execute(operation, now, payout))?
    }

    pub fn read<R>(&self, f: impl FnOnce(&Ledger) -> R) -> Result<R, LedgerError> {
        self.with_lock(|ledger| f(ledger))
    }

    /// See [`Ledger::take_committed`].
    pub fn take_committed(&self) -> Result<Vec<CommittedOperation>, LedgerError> {
        self.with_lock(Ledger::take_committed)
    }

    /// Returns the ledger if this is the last handle.
    pub fn into_inner(self) -> Option<Ledger> {
        Arc::try_unwrap(self.inner).ok().map(Mutex::into_inner)
    }
}
