//! Educator earnings and withdrawal.

use tracing::info;

use crate::ledger::{Amount, Ledger, LedgerError, LedgerEvent, Operation, Timestamp};
use crate::payout::{Payout, Transfer, TransferReason};

impl Ledger {
    pub fn balance_of(&self, educator: &str) -> Amount {
        self.balances.get(educator).copied().unwrap_or(0)
    }

    /// Pays out the caller's whole balance. The balance is zeroed and the
    /// withdrawal committed before the transfer is attempted; a failed
    /// transfer puts the ledger back as it was.
    pub fn withdraw_balance(
        &mut self,
        caller: &str,
        now: Timestamp,
        payout: &mut dyn Payout,
    ) -> Result<Amount, LedgerError> {
        let amount = self.balance_of(caller);
        if amount == 0 {
            return Err(LedgerError::NoBalance {
                educator: caller.to_owned(),
            });
        }
        let withdrawals_paid = self
            .totals
            .withdrawals_paid
            .checked_add(amount)
            .ok_or(LedgerError::Overflow("withdrawals paid"))?;

        let checkpoint = self.checkpoint();
        self.debit(caller, amount)?;
        self.totals.withdrawals_paid = withdrawals_paid;

        info!(educator = caller, amount, "balance withdrawn");
        let transfer = Transfer {
            to: caller.to_owned(),
            amount,
            reason: TransferReason::Withdrawal,
        };
        self.commit_then_deliver(
            checkpoint,
            now,
            Operation::WithdrawBalance {
                caller: caller.to_owned(),
            },
            vec![LedgerEvent::BalanceWithdrawn {
                educator: caller.to_owned(),
                amount,
            }],
            transfer,
            payout,
        )?;
        Ok(amount)
    }
}
