use crate::{classifier::ClassifiedAddress, types::HighValueTx};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything an observer is sent after each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    /// Distinct addresses seen since startup
    #[serde(rename = "totalIPs")]
    pub total_ips: usize,
    pub total_snapshots: u64,
    pub high_value_txs: Vec<HighValueTx>,
    pub geo_locations: Vec<ClassifiedAddress>,
    /// Provider shares of the latest snapshot
    pub provider_stats: Vec<ProviderStat>,
    pub country_stats: Vec<CountryStat>,
    pub geo_distribution: Vec<CountryCount>,
    pub ip_patterns: Vec<IpPattern>,
    /// Most common organizations per country
    pub isps_by_country: Vec<CountryOrganizations>,
    pub trends: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStat {
    pub provider: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryStat {
    pub country: String,
    pub providers: Vec<ProviderCount>,
}

impl CountryStat {
    pub fn total(&self) -> u64 {
        self.providers.iter().map(|p| p.count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCount {
    pub provider: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryCount {
    pub country: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryOrganizations {
    pub country: String,
    pub organizations: Vec<OrganizationCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCount {
    pub organization: String,
    pub count: u64,
}

/// Addresses sharing their first two octets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpPattern {
    pub prefix: String,
    pub value: usize,
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Position in the trend window, oldest first, starting at 1
    pub snapshot: u64,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Share of `count` in `total` as a percentage rounded to one decimal place.
pub(crate) fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}
