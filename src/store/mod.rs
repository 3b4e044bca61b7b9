pub mod ledger_store;
pub mod types;

pub use ledger_store::{memory, postgres, JobUpdate, LedgerStore, LedgerStoreError};
pub use types::{Account, AccountFamily, Job, Journal, LedgerEntry, TransactionRequest};
