use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// One collection cycle: the public gossip addresses seen and the largest
/// transfers found in the recent blocks.
///
/// This is also the JSON blob persisted between runs:
/// `{timestamp, ips, highValueTxs}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub high_value_txs: Vec<HighValueTx>,
}

impl Snapshot {
    pub fn new(ips: Vec<String>, high_value_txs: Vec<HighValueTx>) -> Self {
        Self {
            timestamp: Utc::now(),
            ips,
            high_value_txs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighValueTx {
    pub signature: String,
    pub block: u64,
    /// Balance change of the first account key, in SOL
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A transaction as read from a block: its first signature and the per-account
/// lamport balances before and after execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub signature: String,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
}

impl BlockTransaction {
    /// True when any account's balance moved by at least `threshold` lamports.
    /// Accounts missing from `pre_balances` are treated as starting at zero.
    pub fn moves_at_least(&self, threshold: u64) -> bool {
        self.post_balances.iter().enumerate().any(|(idx, post)| {
            let pre = self.pre_balances.get(idx).copied().unwrap_or_default();
            post.abs_diff(pre) >= threshold
        })
    }

    /// Balance change of the fee payer (account index 0) in lamports.
    pub fn first_account_delta(&self) -> u64 {
        let pre = self.pre_balances.first().copied().unwrap_or_default();
        let post = self.post_balances.first().copied().unwrap_or_default();
        post.abs_diff(pre)
    }

    pub fn to_high_value_tx(&self, block: u64) -> HighValueTx {
        HighValueTx {
            signature: self.signature.clone(),
            block,
            value: self.first_account_delta() as f64 / LAMPORTS_PER_SOL as f64,
            timestamp: Utc::now(),
        }
    }
}

/// Sorts transfers by value, largest first, and keeps the top `limit`.
/// Equal values keep their relative order.
pub fn rank_transfers(txs: &mut Vec<HighValueTx>, limit: usize) {
    txs.sort_by(|a, b| b.value.total_cmp(&a.value));
    txs.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(signature: &str, pre: Vec<u64>, post: Vec<u64>) -> BlockTransaction {
        BlockTransaction {
            signature: signature.to_string(),
            pre_balances: pre,
            post_balances: post,
        }
    }

    fn hv(signature: &str, value: f64) -> HighValueTx {
        HighValueTx {
            signature: signature.to_string(),
            block: 1,
            value,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_checks_every_account() {
        let threshold = 100 * LAMPORTS_PER_SOL;
        // Only the second account crosses the threshold
        let transfer = tx("a", vec![5, 0], vec![4, 150 * LAMPORTS_PER_SOL]);
        assert!(transfer.moves_at_least(threshold));
        // ...but the reported value comes from the first account
        assert_eq!(transfer.first_account_delta(), 1);

        let small = tx("b", vec![10 * LAMPORTS_PER_SOL], vec![LAMPORTS_PER_SOL]);
        assert!(!small.moves_at_least(threshold));
    }

    #[test]
    fn test_missing_pre_balance_counts_as_zero() {
        let transfer = tx("a", vec![], vec![100 * LAMPORTS_PER_SOL]);
        assert!(transfer.moves_at_least(100 * LAMPORTS_PER_SOL));
        assert_eq!(transfer.to_high_value_tx(7).value, 100.0);
        assert_eq!(transfer.to_high_value_tx(7).block, 7);
    }

    #[test]
    fn test_rank_transfers_is_stable_and_bounded() {
        let mut txs = vec![
            hv("low", 1.0),
            hv("tie-first", 5.0),
            hv("high", 9.0),
            hv("tie-second", 5.0),
        ];
        rank_transfers(&mut txs, 3);
        let order: Vec<_> = txs.iter().map(|t| t.signature.as_str()).collect();
        assert_eq!(order, vec!["high", "tie-first", "tie-second"]);
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = Snapshot::new(vec!["1.2.3.4".to_string()], vec![hv("sig", 120.5)]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("timestamp").unwrap().is_string());
        assert_eq!(value["ips"][0], "1.2.3.4");
        assert_eq!(value["highValueTxs"][0]["signature"], "sig");
        assert_eq!(value["highValueTxs"][0]["value"], 120.5);

        let parsed: Snapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
