pub mod solana;

use crate::{Result, types::BlockTransaction};
use async_trait::async_trait;
use mockall::automock;
use std::net::IpAddr;

pub use solana::SolRpcClient;

/// The cluster being sampled.
#[automock]
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Gossip IPs of every node currently in the cluster.
    async fn list_gossip_addresses(&self) -> Result<Vec<IpAddr>>;

    async fn current_slot(&self) -> Result<u64>;

    /// Transactions of the block at `slot`. A slot without a readable block
    /// fails with `Error::SlotSkipped`.
    async fn read_block(&self, slot: u64) -> Result<Vec<BlockTransaction>>;
}
