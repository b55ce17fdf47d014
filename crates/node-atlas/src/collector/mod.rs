pub mod store;

pub use store::{JsonFileStore, SnapshotStore};

use crate::{
    Error, Result,
    client::NodeSource,
    error::with_fixed_retry,
    settings::CollectorSettings,
    types::{HighValueTx, Snapshot, rank_transfers},
};
use indexmap::IndexSet;
use std::{net::IpAddr, sync::Arc};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Samples the cluster on a fixed delay and hands every snapshot to the
/// receiver returned by [`Collector::new`].
pub struct Collector<S> {
    source: S,
    store: Arc<dyn SnapshotStore>,
    settings: CollectorSettings,
    tx: UnboundedSender<Snapshot>,
}

impl<S: NodeSource + 'static> Collector<S> {
    pub fn new(
        source: S,
        store: Arc<dyn SnapshotStore>,
        settings: CollectorSettings,
    ) -> (Self, UnboundedReceiver<Snapshot>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                source,
                store,
                settings,
                tx,
            },
            rx,
        )
    }

    /// Runs one collection. Address and transfer fetches run concurrently and
    /// each degrades to an empty list on failure, so this never fails.
    pub async fn collect_once(&self) -> Snapshot {
        let (ips, high_value_txs) =
            tokio::join!(self.active_addresses(), self.high_value_transfers());
        Snapshot::new(ips, high_value_txs)
    }

    /// Writes the snapshot on the blocking pool; failures are logged and
    /// counted, never returned.
    pub async fn persist(&self, snapshot: &Snapshot) {
        let store = self.store.clone();
        let snapshot = snapshot.clone();
        let written = tokio::task::spawn_blocking(move || store.write(&snapshot)).await;
        if let Err(err) = written.map_err(Error::from).and_then(|result| result) {
            error!(?err, "failed to persist snapshot; continuing");
            metrics::counter!("node_atlas_persist_failed").increment(1);
        }
    }

    /// Cycles until `shutdown_listener` fires. The next cycle is scheduled only
    /// after the current one finished, and cancellation never interrupts a
    /// cycle in flight.
    pub async fn run(&self, shutdown_listener: CancellationToken) -> Result<()> {
        info!(
            interval_secs = self.settings.interval_secs,
            retry_attempts = self.settings.retry_attempts,
            "collector running"
        );

        let mut cycle: u64 = 0;
        while !shutdown_listener.is_cancelled() {
            cycle += 1;
            let snapshot = self.collect_once().await;

            info!(
                cycle,
                ips = snapshot.ips.len(),
                high_value_txs = snapshot.high_value_txs.len(),
                "snapshot collected"
            );
            metrics::counter!("node_atlas_cycles").increment(1);
            metrics::gauge!("node_atlas_snapshot_ips").set(snapshot.ips.len() as f64);

            self.persist(&snapshot).await;

            if self.tx.send(snapshot).is_err() {
                error!("snapshot receiver dropped; stopping collector");
                return Err(Error::SnapshotChannelClosed);
            }

            tokio::select! {
                biased;
                _ = shutdown_listener.cancelled() => break,
                _ = sleep(self.settings.interval()) => {}
            }
        }

        info!(cycles = cycle, "collector stopped");
        Ok(())
    }

    pub fn start(self) -> CollectorHandle {
        self.start_with(CancellationToken::new())
    }

    /// Spawns [`Collector::run`]; cancelling `shutdown_listener` has the same
    /// effect as [`CollectorHandle::stop`].
    pub fn start_with(self, shutdown_listener: CancellationToken) -> CollectorHandle {
        let task = tokio::spawn({
            let shutdown_listener = shutdown_listener.clone();
            async move { self.run(shutdown_listener).await }
        });
        CollectorHandle {
            shutdown_listener,
            task,
        }
    }

    async fn active_addresses(&self) -> Vec<String> {
        match self.source.list_gossip_addresses().await {
            Ok(addresses) => public_addresses(addresses, &self.settings),
            Err(err) => {
                error!(?err, "failed to list cluster nodes; snapshot will have no addresses");
                metrics::counter!("node_atlas_address_fetch_failed").increment(1);
                Vec::new()
            }
        }
    }

    async fn high_value_transfers(&self) -> Vec<HighValueTx> {
        match with_fixed_retry(
            || self.scan_recent_blocks(),
            self.settings.retry_attempts,
            self.settings.retry_delay(),
            "scan_recent_blocks",
        )
        .await
        {
            Ok(transfers) => transfers,
            Err(err) => {
                error!(
                    ?err,
                    attempts = self.settings.retry_attempts,
                    "transfer scan failed on every attempt; snapshot will have no transfers"
                );
                metrics::counter!("node_atlas_transfer_scan_failed").increment(1);
                Vec::new()
            }
        }
    }

    /// Walks back from the current slot until `target_blocks` blocks were read
    /// or `block_scan_limit` slots were examined. Skipped slots are passed
    /// over; any other read error fails the whole scan.
    async fn scan_recent_blocks(&self) -> Result<Vec<HighValueTx>> {
        let latest_slot = self.source.current_slot().await?;
        let threshold = self.settings.threshold_lamports();

        let mut transfers = Vec::new();
        let mut blocks_read = 0;
        for offset in 0..self.settings.block_scan_limit {
            if blocks_read >= self.settings.target_blocks {
                break;
            }
            let Some(slot) = latest_slot.checked_sub(offset) else {
                break;
            };

            match self.source.read_block(slot).await {
                Ok(block) => {
                    blocks_read += 1;
                    transfers.extend(
                        block
                            .iter()
                            .filter(|tx| tx.moves_at_least(threshold))
                            .map(|tx| tx.to_high_value_tx(slot)),
                    );
                }
                Err(Error::SlotSkipped(slot)) => {
                    debug!(slot, "slot skipped");
                    metrics::counter!("node_atlas_slot_skipped").increment(1);
                }
                Err(err) => return Err(err),
            }
        }

        if blocks_read < self.settings.target_blocks {
            warn!(
                latest_slot,
                blocks_read,
                target = self.settings.target_blocks,
                "scan limit reached before enough blocks were read"
            );
        }

        rank_transfers(&mut transfers, self.settings.top_transactions);
        Ok(transfers)
    }
}

/// A running collector.
pub struct CollectorHandle {
    shutdown_listener: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl CollectorHandle {
    /// Prevents further cycles; a cycle already running completes.
    pub fn stop(&self) {
        self.shutdown_listener.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn join(self) -> Result<()> {
        self.task.await?
    }
}

/// Deduplicates addresses and drops those inside `private_ranges`.
fn public_addresses(addresses: Vec<IpAddr>, settings: &CollectorSettings) -> Vec<String> {
    let total = addresses.len();
    let unique: IndexSet<String> = addresses
        .into_iter()
        .map(|ip| (ip.to_string(), ip))
        .filter(|(address, ip)| {
            !settings
                .private_ranges
                .iter()
                .any(|range| range.matches(address, *ip))
        })
        .map(|(address, _)| address)
        .collect();
    debug!(total, public = unique.len(), "filtered gossip addresses");
    unique.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::MockNodeSource,
        types::{BlockTransaction, LAMPORTS_PER_SOL},
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        written: Mutex<Vec<Snapshot>>,
        fail: bool,
    }

    impl SnapshotStore for RecordingStore {
        fn write(&self, snapshot: &Snapshot) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.written.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        fn read(&self) -> Result<Option<Snapshot>> {
            Ok(self.written.lock().unwrap().last().cloned())
        }
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn ips(addresses: &[&str]) -> Vec<IpAddr> {
        addresses.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn whale(signature: &str, sol: u64) -> BlockTransaction {
        BlockTransaction {
            signature: signature.to_string(),
            pre_balances: vec![sol * LAMPORTS_PER_SOL, 0],
            post_balances: vec![0, sol * LAMPORTS_PER_SOL],
        }
    }

    fn rpc_down() -> Error {
        Error::Io(std::io::Error::other("rpc unavailable"))
    }

    #[test]
    fn test_private_ranges_filtered_and_deduplicated() {
        let filtered = public_addresses(
            ips(&[
                "10.1.2.3",
                "52.10.1.1",
                "172.16.5.5",
                "172.104.1.1",
                "192.168.0.1",
                "127.0.0.1",
                "52.10.1.1",
            ]),
            &settings(),
        );
        assert_eq!(filtered, vec!["52.10.1.1", "172.104.1.1"]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_keeps_addresses() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .times(1)
            .returning(|| Ok(ips(&["52.10.1.1", "148.251.1.1"])));
        source
            .expect_current_slot()
            .times(3)
            .returning(|| Err(rpc_down()));

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;

        assert_eq!(snapshot.ips, vec!["52.10.1.1", "148.251.1.1"]);
        assert!(snapshot.high_value_txs.is_empty());
    }

    #[tokio::test]
    async fn test_block_error_restarts_the_whole_scan() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().times(2).returning(|| Ok(100));

        let failures = Mutex::new(1);
        source.expect_read_block().returning(move |slot| {
            let mut failures = failures.lock().unwrap();
            if slot == 98 && *failures > 0 {
                *failures -= 1;
                return Err(rpc_down());
            }
            Ok(vec![whale(&format!("sig-{slot}"), 200)])
        });

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;

        let blocks: Vec<_> = snapshot.high_value_txs.iter().map(|t| t.block).collect();
        assert_eq!(blocks, vec![100, 99, 98, 97, 96]);
    }

    #[tokio::test]
    async fn test_skipped_slots_do_not_count() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().times(1).returning(|| Ok(1_000));
        // Every odd slot is skipped, so reaching 5 blocks takes 9 slots
        source.expect_read_block().times(9).returning(|slot| {
            if slot % 2 == 1 {
                Err(Error::SlotSkipped(slot))
            } else {
                Ok(vec![whale(&format!("sig-{slot}"), 150)])
            }
        });

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;

        let blocks: Vec<_> = snapshot.high_value_txs.iter().map(|t| t.block).collect();
        assert_eq!(blocks, vec![1_000, 998, 996, 994, 992]);
    }

    #[tokio::test]
    async fn test_scan_stops_at_limit() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().returning(|| Ok(500));
        source
            .expect_read_block()
            .times(20)
            .returning(|slot| Err(Error::SlotSkipped(slot)));

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;
        assert!(snapshot.high_value_txs.is_empty());
    }

    #[tokio::test]
    async fn test_scan_stops_at_genesis() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().returning(|| Ok(2));
        source
            .expect_read_block()
            .times(3)
            .returning(|slot| Ok(vec![whale(&format!("sig-{slot}"), 200)]));

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;
        assert_eq!(snapshot.high_value_txs.len(), 3);
    }

    #[tokio::test]
    async fn test_threshold_and_top_k() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().returning(|| Ok(50));
        source.expect_read_block().returning(|slot| {
            let mut block: Vec<_> = (0..4)
                .map(|idx| whale(&format!("sig-{slot}-{idx}"), 100 + slot + idx))
                .collect();
            // Below the 100 SOL threshold on every account
            block.push(whale(&format!("dust-{slot}"), 99));
            Ok(block)
        });

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;

        assert_eq!(snapshot.high_value_txs.len(), 10);
        assert!(
            snapshot
                .high_value_txs
                .windows(2)
                .all(|pair| pair[0].value >= pair[1].value)
        );
        assert_eq!(snapshot.high_value_txs[0].value, 153.0);
        assert!(
            snapshot
                .high_value_txs
                .iter()
                .all(|tx| !tx.signature.starts_with("dust"))
        );
    }

    #[tokio::test]
    async fn test_address_failure_keeps_transfers() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Err(rpc_down()));
        source.expect_current_slot().returning(|| Ok(10));
        source
            .expect_read_block()
            .returning(|slot| Ok(vec![whale(&format!("sig-{slot}"), 500)]));

        let (collector, _rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        let snapshot = collector.collect_once().await;

        assert!(snapshot.ips.is_empty());
        assert_eq!(snapshot.high_value_txs.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_persists_notifies_and_stops() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(ips(&["52.10.1.1"])));
        source.expect_current_slot().returning(|| Err(rpc_down()));

        let store = Arc::new(RecordingStore::default());
        let (collector, mut rx) = Collector::new(source, store.clone(), settings());
        let handle = collector.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.ips, vec!["52.10.1.1"]);
        assert!(second.timestamp >= first.timestamp);
        assert!(store.written.lock().unwrap().len() >= 2);

        handle.stop();
        handle.join().await.unwrap();
        // The sender went away with the collector
        while rx.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_still_notifies() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(ips(&["52.10.1.1"])));
        source.expect_current_slot().returning(|| Ok(0));
        source.expect_read_block().returning(|_| Ok(vec![]));

        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let (collector, mut rx) = Collector::new(source, store, settings());
        let handle = collector.start();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.ips, vec!["52.10.1.1"]);

        handle.stop();
        handle.join().await.unwrap();
    }

    #[derive(Default)]
    struct ThreadRecordingStore {
        writer: Mutex<Option<std::thread::ThreadId>>,
    }

    impl SnapshotStore for ThreadRecordingStore {
        fn write(&self, _snapshot: &Snapshot) -> Result<()> {
            *self.writer.lock().unwrap() = Some(std::thread::current().id());
            Ok(())
        }

        fn read(&self) -> Result<Option<Snapshot>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_persist_writes_off_the_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore::default());
        let (collector, _rx) = Collector::new(MockNodeSource::new(), store.clone(), settings());

        collector
            .persist(&Snapshot::new(vec!["52.10.1.1".to_string()], vec![]))
            .await;

        let writer = store.writer.lock().unwrap().expect("store was written");
        assert_ne!(writer, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_collector() {
        let mut source = MockNodeSource::new();
        source
            .expect_list_gossip_addresses()
            .returning(|| Ok(vec![]));
        source.expect_current_slot().returning(|| Ok(0));
        source.expect_read_block().returning(|_| Ok(vec![]));

        let (collector, rx) =
            Collector::new(source, Arc::new(RecordingStore::default()), settings());
        drop(rx);

        let result = collector.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::SnapshotChannelClosed)));
    }
}
