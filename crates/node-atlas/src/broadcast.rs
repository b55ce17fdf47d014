use crate::{
    Result,
    aggregator::{AnalysisReport, Aggregator},
    types::Snapshot,
};
use std::sync::Arc;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc::UnboundedReceiver,
};
use tracing::{debug, info, warn};

/// Pushes a fresh report to every subscribed observer after each ingest.
pub struct Broadcaster {
    aggregator: Arc<Aggregator>,
    tx: broadcast::Sender<Arc<AnalysisReport>>,
}

impl Broadcaster {
    pub fn new(aggregator: Arc<Aggregator>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { aggregator, tx }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Registers an observer. Its first report reflects the state at
    /// subscription time; every later ingest delivers another one.
    pub async fn subscribe(&self) -> Observer {
        // Subscribe before reading so an ingest racing with us still reaches
        // the observer, at worst as a duplicate of the initial report.
        let rx = self.tx.subscribe();
        let initial = Arc::new(self.aggregator.report().await);
        metrics::gauge!("node_atlas_observers").set(self.tx.receiver_count() as f64);
        Observer {
            initial: Some(initial),
            rx,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sends the current report to every observer and returns how many
    /// received it.
    pub async fn publish(&self) -> usize {
        let report = Arc::new(self.aggregator.report().await);
        let delivered = self.tx.send(report).unwrap_or_default();
        metrics::counter!("node_atlas_reports_published").increment(1);
        metrics::gauge!("node_atlas_observers").set(delivered as f64);
        delivered
    }

    /// Ingests snapshots from the collector and publishes after each one.
    /// Returns once every sender is gone, which happens after the collector
    /// has stopped, so the snapshot of a cycle finishing during shutdown is
    /// still ingested and published.
    pub async fn run(&self, mut snapshots: UnboundedReceiver<Snapshot>) -> Result<()> {
        info!("report broadcaster running");

        while let Some(snapshot) = snapshots.recv().await {
            self.handle(&snapshot).await;
        }

        info!("snapshot channel closed; report broadcaster stopped");
        Ok(())
    }

    async fn handle(&self, snapshot: &Snapshot) {
        if !self.aggregator.ingest(snapshot).await {
            debug!("snapshot carried no addresses; aggregate unchanged");
        }
        let delivered = self.publish().await;
        debug!(delivered, "report published");
    }
}

/// Receiving end of a [`Broadcaster`] subscription.
pub struct Observer {
    initial: Option<Arc<AnalysisReport>>,
    rx: broadcast::Receiver<Arc<AnalysisReport>>,
}

impl Observer {
    /// Next report, or `None` once the broadcaster is gone. An observer that
    /// falls behind skips the reports it missed and resumes with the oldest
    /// one still buffered.
    pub async fn next(&mut self) -> Option<Arc<AnalysisReport>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(report) => return Some(report),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagging; skipping reports");
                    metrics::counter!("node_atlas_reports_skipped").increment(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
