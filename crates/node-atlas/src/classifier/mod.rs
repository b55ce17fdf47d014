pub mod geo;
pub mod rules;

pub use geo::{CsvGeoDatabase, GeoLookup, GeoRecord, NoGeo};
pub use rules::{Matcher, OTHER_PROVIDER, ProviderRule, ProviderRuleset, RuleOverlap};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub const UNKNOWN: &str = "Unknown";

/// Provider and location facts derived from one node address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedAddress {
    #[serde(rename = "ip")]
    pub address: String,
    pub provider: String,
    pub country: String,
    pub city: String,
    #[serde(rename = "ll", default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<[f64; 2]>,
    #[serde(rename = "org")]
    pub organization: String,
}

impl ClassifiedAddress {
    fn unresolved(address: &str) -> Self {
        Self {
            address: address.to_string(),
            provider: OTHER_PROVIDER.to_string(),
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            coordinates: None,
            organization: UNKNOWN.to_string(),
        }
    }
}

/// Maps an address to a provider label (first matching rule) and a location
/// (geo database). Holds no state beyond its inputs, so the same address
/// always classifies the same way.
pub struct Classifier {
    rules: ProviderRuleset,
    geo: Box<dyn GeoLookup>,
}

impl Classifier {
    pub fn new(rules: ProviderRuleset, geo: Box<dyn GeoLookup>) -> Self {
        Self { rules, geo }
    }

    pub fn rules(&self) -> &ProviderRuleset {
        &self.rules
    }

    pub fn classify(&self, address: &str) -> ClassifiedAddress {
        let Ok(ip) = address.parse::<IpAddr>() else {
            return ClassifiedAddress::unresolved(address);
        };

        let provider = self.rules.provider_for(address, ip);
        let geo = self.geo.lookup(ip).unwrap_or_default();

        ClassifiedAddress {
            address: address.to_string(),
            provider: provider.to_string(),
            country: geo.country.unwrap_or_else(|| UNKNOWN.to_string()),
            city: geo.city.unwrap_or_else(|| UNKNOWN.to_string()),
            coordinates: geo.coordinates,
            organization: geo.organization.unwrap_or_else(|| provider.to_string()),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ProviderRuleset::default(), Box::new(NoGeo))
    }
}
