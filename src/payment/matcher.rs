use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::amount::{from_lamports, to_lamports};
use super::ledger::{Ledger, LedgerError};
use crate::config::LedgerConfig;

/// A ledger transfer that pays for a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMatch {
    pub transaction_id: String,
    /// Coins actually received.
    pub amount: f64,
}

/// Finds incoming transfers whose amount identifies a work item.
///
/// The ledger offers no memo field usable for correlation, so each item's
/// expected amount is unique and the amount itself is the key.
pub struct PaymentMatcher<L> {
    ledger: L,
    address: String,
    scan_limit: usize,
    tolerance: f64,
}

impl<L: Ledger> PaymentMatcher<L> {
    pub fn new(ledger: L, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            address: config.payment_address.clone(),
            scan_limit: config.scan_limit,
            tolerance: config.tolerance,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// The best transfer of `expected` coins received no earlier than
    /// `not_before`, or `None`. Ledger errors count as not found.
    pub async fn find_payment(
        &self,
        expected: f64,
        not_before: DateTime<Utc>,
    ) -> Option<PaymentMatch> {
        self.candidates(expected, not_before).await.into_iter().next()
    }

    /// Every acceptable transfer, closest to `expected` first; equally close
    /// transfers keep ledger order (newest first). The caller still has to
    /// record one before it counts as consumed.
    pub async fn candidates(&self, expected: f64, not_before: DateTime<Utc>) -> Vec<PaymentMatch> {
        match self.scan(expected, not_before).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "ledger scan failed");
                Vec::new()
            }
        }
    }

    async fn scan(
        &self,
        expected: f64,
        not_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentMatch>, LedgerError> {
        let expected_lamports = to_lamports(expected);
        let band = (expected_lamports as f64 * self.tolerance).abs();
        let cutoff = not_before.timestamp();

        let signatures = self
            .ledger
            .recent_signatures(&self.address, self.scan_limit)
            .await?;

        let mut found = Vec::new();

        for sig in signatures {
            // History is newest first: once past the cutoff nothing later qualifies.
            match sig.block_time {
                Some(t) if t < cutoff => break,
                Some(_) => {}
                None => continue,
            }
            if sig.err.is_some() {
                continue;
            }

            let Some(tx) = self.ledger.transaction(&sig.signature).await? else {
                continue;
            };
            if tx.failed {
                continue;
            }
            let Some(received) = tx.received_lamports(&self.address) else {
                continue;
            };
            if received <= 0 {
                continue;
            }

            let distance = received.abs_diff(expected_lamports);
            if distance as f64 > band {
                continue;
            }
            if distance == 0 {
                debug!(tx = %sig.signature, "exact payment amount found");
            }
            found.push((
                distance,
                PaymentMatch {
                    transaction_id: sig.signature,
                    amount: from_lamports(received),
                },
            ));
        }

        found.sort_by_key(|(distance, _)| *distance);
        Ok(found.into_iter().map(|(_, m)| m).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::payment::ledger::{LedgerTransaction, SignatureInfo};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory ledger for tests. Transactions are listed newest first.
    #[derive(Default)]
    pub(crate) struct FakeLedger {
        pub history: Vec<SignatureInfo>,
        pub transactions: HashMap<String, LedgerTransaction>,
        pub balance: u64,
        pub fail: bool,
        pub fetched: Mutex<Vec<String>>,
    }

    impl FakeLedger {
        /// Adds a transfer of `lamports` from "Payer" to `wallet`.
        pub fn push_transfer(&mut self, signature: &str, wallet: &str, lamports: u64, at: i64) {
            self.history.push(SignatureInfo {
                signature: signature.into(),
                block_time: Some(at),
                err: None,
            });
            self.transactions.insert(
                signature.into(),
                LedgerTransaction {
                    account_keys: vec!["Payer".into(), wallet.into()],
                    pre_balances: vec![10_000_000_000, 1_000],
                    post_balances: vec![10_000_000_000 - lamports - 5_000, 1_000 + lamports],
                    failed: false,
                },
            );
        }
    }

    impl Ledger for FakeLedger {
        async fn recent_signatures(
            &self,
            _address: &str,
            limit: usize,
        ) -> Result<Vec<SignatureInfo>, LedgerError> {
            if self.fail {
                return Err(LedgerError::Decode("node unavailable".into()));
            }
            Ok(self.history.iter().take(limit).cloned().collect())
        }

        async fn transaction(
            &self,
            signature: &str,
        ) -> Result<Option<LedgerTransaction>, LedgerError> {
            self.fetched.lock().unwrap().push(signature.to_string());
            Ok(self.transactions.get(signature).cloned())
        }

        async fn balance(&self, _address: &str) -> Result<u64, LedgerError> {
            if self.fail {
                return Err(LedgerError::Decode("node unavailable".into()));
            }
            Ok(self.balance)
        }
    }

    const WALLET: &str = "Wallet";

    fn matcher(ledger: FakeLedger) -> PaymentMatcher<FakeLedger> {
        PaymentMatcher::new(
            ledger,
            &LedgerConfig {
                payment_address: WALLET.into(),
                ..LedgerConfig::default()
            },
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn finds_matching_transfer() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("sig1", WALLET, 5_263_200, 1_000);

        let found = matcher(ledger).find_payment(0.005_263_2, at(900)).await.unwrap();
        assert_eq!(found.transaction_id, "sig1");
        assert!((found.amount - 0.005_263_2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn transfers_before_not_before_are_ignored() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("new", WALLET, 1_000_000, 2_000);
        ledger.push_transfer("old", WALLET, 5_000_000, 1_000);

        let m = matcher(ledger);
        assert!(m.find_payment(0.005, at(1_500)).await.is_none());
        let fetched = m.ledger().fetched.lock().unwrap().clone();
        assert_eq!(fetched, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn outside_tolerance_is_not_a_match() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("short", WALLET, 4_900_000, 1_000);
        ledger.push_transfer("over", WALLET, 5_100_000, 1_000);

        assert!(matcher(ledger).find_payment(0.005, at(0)).await.is_none());
    }

    #[tokio::test]
    async fn within_tolerance_is_a_match() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("close", WALLET, 5_020_000, 1_000);

        let found = matcher(ledger).find_payment(0.005, at(0)).await.unwrap();
        assert_eq!(found.transaction_id, "close");
    }

    #[tokio::test]
    async fn exact_amount_beats_earlier_near_match() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("neighbour", WALLET, 5_000_008, 1_001);
        ledger.push_transfer("mine", WALLET, 5_000_007, 1_000);

        let m = matcher(ledger);
        let found = m.find_payment(0.005_000_007, at(0)).await.unwrap();
        assert_eq!(found.transaction_id, "mine");

        let all = m.candidates(0.005_000_007, at(0)).await;
        let ids: Vec<_> = all.iter().map(|c| c.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["mine", "neighbour"]);
    }

    #[tokio::test]
    async fn near_matches_are_ranked_by_closeness() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("far", WALLET, 5_000_900, 1_002);
        ledger.push_transfer("close", WALLET, 4_999_998, 1_001);
        ledger.push_transfer("closer", WALLET, 5_000_001, 1_000);

        let all = matcher(ledger).candidates(0.005, at(0)).await;
        let ids: Vec<_> = all.iter().map(|c| c.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["closer", "close", "far"]);
    }

    #[tokio::test]
    async fn failed_and_outgoing_transactions_are_skipped() {
        let mut ledger = FakeLedger::default();
        ledger.push_transfer("failed", WALLET, 5_000_000, 1_000);
        ledger.history[0].err = Some(serde_json::json!({"InstructionError": [0, "Custom"]}));
        ledger.push_transfer("elsewhere", "OtherWallet", 5_000_000, 1_000);

        assert!(matcher(ledger).find_payment(0.005, at(0)).await.is_none());
    }

    #[tokio::test]
    async fn ledger_errors_are_not_found() {
        let ledger = FakeLedger {
            fail: true,
            ..FakeLedger::default()
        };
        assert!(matcher(ledger).find_payment(0.005, at(0)).await.is_none());
    }

    #[tokio::test]
    async fn scan_respects_limit() {
        let mut ledger = FakeLedger::default();
        for i in 0..30 {
            ledger.push_transfer(&format!("filler{i}"), WALLET, 1_000, 2_000 - i);
        }
        ledger.push_transfer("target", WALLET, 5_000_000, 1_000);

        assert!(matcher(ledger).find_payment(0.005, at(0)).await.is_none());
    }
}
