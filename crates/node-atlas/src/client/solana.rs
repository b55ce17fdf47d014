use crate::{
    Error, Result,
    client::NodeSource,
    error::is_skipped_slot,
    types::BlockTransaction,
};
use async_trait::async_trait;
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_config::RpcBlockConfig};
use solana_commitment_config::CommitmentConfig;
use solana_transaction_status_client_types::{
    EncodedTransaction, EncodedTransactionWithStatusMeta, TransactionDetails,
    UiTransactionEncoding,
};
use std::net::IpAddr;
use tracing::debug;
use url::Url;

pub struct SolRpcClient {
    client: RpcClient,
    block_config: RpcBlockConfig,
}

impl SolRpcClient {
    pub fn new(rpc_url: Url, commitment: CommitmentConfig) -> Self {
        Self {
            client: RpcClient::new_with_commitment(rpc_url.into(), commitment),
            // Signatures and balances are all we read from a block
            block_config: RpcBlockConfig {
                encoding: Some(UiTransactionEncoding::Json),
                transaction_details: Some(TransactionDetails::Accounts),
                rewards: Some(false),
                commitment: Some(commitment),
                max_supported_transaction_version: Some(0),
            },
        }
    }
}

#[async_trait]
impl NodeSource for SolRpcClient {
    async fn list_gossip_addresses(&self) -> Result<Vec<IpAddr>> {
        let nodes = self.client.get_cluster_nodes().await?;
        let total = nodes.len();
        let addresses: Vec<IpAddr> = nodes
            .into_iter()
            .filter_map(|contact| contact.gossip)
            .map(|gossip| gossip.ip())
            .collect();
        debug!(
            nodes = total,
            with_gossip = addresses.len(),
            "fetched cluster nodes"
        );
        Ok(addresses)
    }

    async fn current_slot(&self) -> Result<u64> {
        Ok(self.client.get_slot().await?)
    }

    async fn read_block(&self, slot: u64) -> Result<Vec<BlockTransaction>> {
        let block = match self
            .client
            .get_block_with_config(slot, self.block_config)
            .await
        {
            Ok(block) => block,
            Err(err) if is_skipped_slot(&err) => return Err(Error::SlotSkipped(slot)),
            Err(err) => return Err(err.into()),
        };

        Ok(block
            .transactions
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_block_transaction)
            .collect())
    }
}

fn into_block_transaction(tx: EncodedTransactionWithStatusMeta) -> Option<BlockTransaction> {
    let signature = first_signature(&tx.transaction)?;
    let meta = tx.meta?;
    Some(BlockTransaction {
        signature,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
    })
}

fn first_signature(tx: &EncodedTransaction) -> Option<String> {
    match tx {
        EncodedTransaction::Json(ui_tx) => ui_tx.signatures.first().cloned(),
        EncodedTransaction::Accounts(accounts) => accounts.signatures.first().cloned(),
        binary => binary
            .decode()
            .and_then(|decoded| decoded.signatures.first().map(ToString::to_string)),
    }
}
