pub mod report;

pub use report::{
    AnalysisReport, CountryCount, CountryOrganizations, CountryStat, IpPattern, OrganizationCount,
    ProviderCount, ProviderStat, TrendPoint,
};

use crate::{
    classifier::{ClassifiedAddress, Classifier},
    settings::AggregatorSettings,
    types::{HighValueTx, Snapshot, rank_transfers},
};
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use report::percentage;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

/// Address count of one ingested snapshot.
#[derive(Debug, Clone)]
struct TrendSample {
    count: usize,
    timestamp: DateTime<Utc>,
}

/// State folded from every snapshot since startup.
///
/// Maps keep first-observed order, so every ranking below breaks ties by
/// whichever entry was seen first.
#[derive(Debug)]
pub struct AggregateState {
    limits: AggregatorSettings,
    addresses: IndexSet<String>,
    classifications: IndexMap<String, ClassifiedAddress>,
    country_provider_tally: IndexMap<String, IndexMap<String, u64>>,
    trend_window: VecDeque<TrendSample>,
    top_transactions: Vec<HighValueTx>,
    latest_provider_counts: IndexMap<String, u64>,
    snapshots_ingested: u64,
}

impl AggregateState {
    pub fn new(limits: AggregatorSettings) -> Self {
        Self {
            trend_window: VecDeque::with_capacity(limits.trend_window + 1),
            limits,
            addresses: IndexSet::new(),
            classifications: IndexMap::new(),
            country_provider_tally: IndexMap::new(),
            top_transactions: Vec::new(),
            latest_provider_counts: IndexMap::new(),
            snapshots_ingested: 0,
        }
    }

    /// Folds one snapshot in. A snapshot without addresses changes nothing and
    /// returns false.
    pub fn ingest(&mut self, classifier: &Classifier, snapshot: &Snapshot) -> bool {
        let unique: IndexSet<&str> = snapshot.ips.iter().map(String::as_str).collect();
        if unique.is_empty() {
            debug!("ignoring snapshot without addresses");
            return false;
        }

        let mut provider_counts: IndexMap<String, u64> = IndexMap::new();
        let mut classified_now: u64 = 0;
        for &address in &unique {
            let classified = self
                .classifications
                .entry(address.to_string())
                .or_insert_with(|| {
                    classified_now += 1;
                    classifier.classify(address)
                });

            *self
                .country_provider_tally
                .entry(classified.country.clone())
                .or_default()
                .entry(classified.provider.clone())
                .or_default() += 1;
            *provider_counts
                .entry(classified.provider.clone())
                .or_default() += 1;

            if !self.addresses.contains(address) {
                self.addresses.insert(address.to_string());
            }
        }
        self.latest_provider_counts = provider_counts;

        let mut transfers = snapshot.high_value_txs.clone();
        rank_transfers(&mut transfers, self.limits.top_transactions);
        self.top_transactions = transfers;

        self.snapshots_ingested += 1;
        self.trend_window.push_back(TrendSample {
            count: unique.len(),
            timestamp: snapshot.timestamp,
        });
        while self.trend_window.len() > self.limits.trend_window {
            self.trend_window.pop_front();
        }

        metrics::counter!("node_atlas_addresses_classified").increment(classified_now);
        metrics::gauge!("node_atlas_distinct_addresses").set(self.addresses.len() as f64);
        debug!(
            snapshot = self.snapshots_ingested,
            addresses = unique.len(),
            newly_classified = classified_now,
            "snapshot ingested"
        );
        true
    }

    pub fn total_addresses(&self) -> usize {
        self.addresses.len()
    }

    pub fn snapshots_ingested(&self) -> u64 {
        self.snapshots_ingested
    }

    /// The trend window, oldest first, numbered by position from 1.
    pub fn trends(&self) -> Vec<TrendPoint> {
        self.trend_window
            .iter()
            .zip(1u64..)
            .map(|(sample, snapshot)| TrendPoint {
                snapshot,
                count: sample.count,
                timestamp: sample.timestamp,
            })
            .collect()
    }

    pub fn top_transactions(&self) -> &[HighValueTx] {
        &self.top_transactions
    }

    pub fn classification(&self, address: &str) -> Option<&ClassifiedAddress> {
        self.classifications.get(address)
    }

    pub fn tally(&self, country: &str, provider: &str) -> u64 {
        self.country_provider_tally
            .get(country)
            .and_then(|providers| providers.get(provider))
            .copied()
            .unwrap_or_default()
    }

    pub fn report(&self) -> AnalysisReport {
        AnalysisReport {
            total_ips: self.addresses.len(),
            total_snapshots: self.snapshots_ingested,
            high_value_txs: self.top_transactions.clone(),
            geo_locations: self.classifications.values().cloned().collect(),
            provider_stats: self.provider_stats(),
            country_stats: self.country_stats(),
            geo_distribution: self.geo_distribution(),
            ip_patterns: self.ip_patterns(),
            isps_by_country: self.isps_by_country(),
            trends: self.trends(),
        }
    }

    fn provider_stats(&self) -> Vec<ProviderStat> {
        let mut counts: Vec<(&String, u64)> = self
            .latest_provider_counts
            .iter()
            .map(|(provider, count)| (provider, *count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        let total: u64 = counts.iter().map(|(_, count)| count).sum();
        counts
            .into_iter()
            .map(|(provider, count)| ProviderStat {
                provider: provider.clone(),
                count,
                percentage: percentage(count, total),
            })
            .collect()
    }

    fn country_stats(&self) -> Vec<CountryStat> {
        let mut stats: Vec<CountryStat> = self
            .country_provider_tally
            .iter()
            .map(|(country, providers)| {
                let mut providers: Vec<ProviderCount> = providers
                    .iter()
                    .map(|(provider, count)| ProviderCount {
                        provider: provider.clone(),
                        count: *count,
                    })
                    .collect();
                providers.sort_by(|a, b| b.count.cmp(&a.count));
                CountryStat {
                    country: country.clone(),
                    providers,
                }
            })
            .collect();
        stats.sort_by_key(|stat| std::cmp::Reverse(stat.total()));
        stats
    }

    fn geo_distribution(&self) -> Vec<CountryCount> {
        let mut counts: IndexMap<&str, u64> = IndexMap::new();
        for classified in self.classifications.values() {
            *counts.entry(classified.country.as_str()).or_default() += 1;
        }
        let mut distribution: Vec<CountryCount> = counts
            .into_iter()
            .map(|(country, count)| CountryCount {
                country: country.to_string(),
                count,
            })
            .collect();
        distribution.sort_by_key(|entry| std::cmp::Reverse(entry.count));
        distribution
    }

    /// Organizations per country over every classified address, the most
    /// common first, at most `top_organizations` each. Countries keep
    /// first-seen order.
    fn isps_by_country(&self) -> Vec<CountryOrganizations> {
        let mut tally: IndexMap<&str, IndexMap<&str, u64>> = IndexMap::new();
        for classified in self.classifications.values() {
            *tally
                .entry(classified.country.as_str())
                .or_default()
                .entry(classified.organization.as_str())
                .or_default() += 1;
        }

        tally
            .into_iter()
            .map(|(country, organizations)| {
                let mut organizations: Vec<OrganizationCount> = organizations
                    .into_iter()
                    .map(|(organization, count)| OrganizationCount {
                        organization: organization.to_string(),
                        count,
                    })
                    .collect();
                organizations.sort_by_key(|entry| std::cmp::Reverse(entry.count));
                organizations.truncate(self.limits.top_organizations);
                CountryOrganizations {
                    country: country.to_string(),
                    organizations,
                }
            })
            .collect()
    }

    fn ip_patterns(&self) -> Vec<IpPattern> {
        let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
        for address in &self.addresses {
            groups
                .entry(two_octet_prefix(address))
                .or_default()
                .push(address.clone());
        }
        let mut patterns: Vec<IpPattern> = groups
            .into_iter()
            .map(|(prefix, ips)| IpPattern {
                prefix,
                value: ips.len(),
                ips,
            })
            .collect();
        patterns.sort_by_key(|pattern| std::cmp::Reverse(pattern.value));
        patterns.truncate(self.limits.top_patterns);
        patterns
    }
}

fn two_octet_prefix(address: &str) -> String {
    let mut octets = address.splitn(3, '.');
    match (octets.next(), octets.next()) {
        (Some(first), Some(second)) => format!("{first}.{second}"),
        _ => address.to_string(),
    }
}

/// Shared handle to the aggregate. Ingests are serialized against each other
/// and against reports, so a report never observes a half-applied snapshot.
pub struct Aggregator {
    classifier: Classifier,
    state: RwLock<AggregateState>,
}

impl Aggregator {
    pub fn new(classifier: Classifier, limits: AggregatorSettings) -> Self {
        Self {
            classifier,
            state: RwLock::new(AggregateState::new(limits)),
        }
    }

    pub async fn ingest(&self, snapshot: &Snapshot) -> bool {
        let mut state = self.state.write().await;
        state.ingest(&self.classifier, snapshot)
    }

    pub async fn report(&self) -> AnalysisReport {
        self.state.read().await.report()
    }
}
