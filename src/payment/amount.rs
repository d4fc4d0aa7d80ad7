use crate::oracle::PriceOracle;

/// Base units per coin.
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

pub fn to_lamports(amount: f64) -> i64 {
    (amount * LAMPORTS_PER_SOL).round() as i64
}

pub fn from_lamports(lamports: i64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

/// Expected payment for an item, in lamports.
///
/// The fiat cost converted at `rate`, plus a per-item offset of
/// `item_id * offset_scale` coins. With the default scale of 1e-9 the offset
/// is exactly `item_id` lamports, so two items with the same cost and rate
/// never share an amount. The offset grows with the id: at 200 fiat units
/// per coin it stays under a cent up to id 49_999.
pub fn expected_lamports(item_id: i64, cost_fiat: f64, rate: f64, offset_scale: f64) -> i64 {
    let base = to_lamports(cost_fiat / rate);
    let offset = (item_id as f64 * offset_scale * LAMPORTS_PER_SOL).round() as i64;
    base + offset
}

/// Expected payment for an item, in coins, at the oracle's current rate.
pub async fn compute_expected_amount(
    oracle: &PriceOracle,
    item_id: i64,
    cost_fiat: f64,
    offset_scale: f64,
) -> f64 {
    let rate = oracle.rate().await;
    from_lamports(expected_lamports(item_id, cost_fiat, rate, offset_scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ten_minutes_at_fixed_rate() {
        let rate = 150.0;
        let id = 42;
        let cost = 10.0 * 0.10;
        assert!((cost - 1.00_f64).abs() < 1e-12);

        let amount = from_lamports(expected_lamports(id, cost, rate, 1e-9));
        let formula = 1.00 / rate + id as f64 / 1e9;
        assert!((amount - formula).abs() < 1e-9, "{amount} vs {formula}");
    }

    #[test]
    fn amounts_are_pairwise_distinct() {
        let amounts: HashSet<i64> = (1..=5_000)
            .map(|id| expected_lamports(id, 1.0, 187.31, 1e-9))
            .collect();
        assert_eq!(amounts.len(), 5_000);
    }

    #[test]
    fn offset_stays_sub_cent_below_fifty_thousand_items() {
        let rate = 200.0;
        let plain = to_lamports(1.0 / rate);
        for id in [1, 1_000, 49_999] {
            let extra_fiat = from_lamports(expected_lamports(id, 1.0, rate, 1e-9) - plain) * rate;
            assert!(extra_fiat < 0.01, "id {id}: {extra_fiat}");
        }
        let extra_fiat = from_lamports(expected_lamports(100_000, 1.0, rate, 1e-9) - plain) * rate;
        assert!((extra_fiat - 0.02).abs() < 1e-9, "{extra_fiat}");
    }

    #[test]
    fn lamport_conversion_rounds() {
        assert_eq!(to_lamports(0.000_000_001_4), 1);
        assert_eq!(to_lamports(1.5), 1_500_000_000);
        assert_eq!(from_lamports(2_500_000_000), 2.5);
    }
}
