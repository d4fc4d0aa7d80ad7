//! Unique-amount payment matching against the Solana ledger.

mod amount;
mod ledger;
mod matcher;

pub use amount::{
    LAMPORTS_PER_SOL, compute_expected_amount, expected_lamports, from_lamports, to_lamports,
};
pub use ledger::{Ledger, LedgerError, LedgerTransaction, SignatureInfo, SolanaRpc};
pub use matcher::{PaymentMatch, PaymentMatcher};

#[cfg(test)]
pub(crate) use matcher::tests::FakeLedger;
