use crate::{Error, Result, classifier::rules::Ipv4Cidr};
use serde::Deserialize;
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    path::Path,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoRecord {
    pub country: Option<String>,
    pub city: Option<String>,
    /// Latitude and longitude
    pub coordinates: Option<[f64; 2]>,
    pub organization: Option<String>,
}

pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoRecord>;
}

/// Used when no geo database is configured.
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoRecord> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct GeoRow {
    network: String,
    country: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    organization: Option<String>,
}

#[derive(Debug)]
struct GeoRange {
    start: u32,
    end: u32,
    record: GeoRecord,
}

/// IPv4 range table loaded from CSV with the header
/// `network,country,city,latitude,longitude,organization`.
///
/// Networks must not overlap; an overlapping row is dropped with a warning.
#[derive(Debug, Default)]
pub struct CsvGeoDatabase {
    ranges: Vec<GeoRange>,
}

impl CsvGeoDatabase {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Self::from_reader(csv::Reader::from_path(path.as_ref())?)?;
        info!(path = %path.as_ref().display(), ranges = db.len(), "loaded geo database");
        Ok(db)
    }

    pub fn from_reader<R: io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut ranges = Vec::new();
        for (idx, row) in reader.deserialize::<GeoRow>().enumerate() {
            let row = row?;
            // Header is line 1
            let line = idx + 2;
            let cidr: Ipv4Cidr = row.network.parse().map_err(|_| Error::GeoRow {
                row: line,
                reason: format!("invalid network `{}`", row.network),
            })?;
            let (start, end) = cidr.bounds();
            let coordinates = match (row.latitude, row.longitude) {
                (Some(lat), Some(lon)) => Some([lat, lon]),
                _ => None,
            };
            ranges.push(GeoRange {
                start,
                end,
                record: GeoRecord {
                    country: non_empty(row.country),
                    city: non_empty(row.city),
                    coordinates,
                    organization: non_empty(row.organization),
                },
            });
        }

        ranges.sort_by_key(|range| (range.start, range.end));

        let mut disjoint: Vec<GeoRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(prev) = disjoint.last()
                && range.start <= prev.end
            {
                warn!(
                    network = %Ipv4Addr::from(range.start),
                    "overlapping geo range ignored"
                );
                continue;
            }
            disjoint.push(range);
        }

        Ok(Self { ranges: disjoint })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoLookup for CsvGeoDatabase {
    fn lookup(&self, ip: IpAddr) -> Option<GeoRecord> {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        let ip = u32::from(v4);
        let idx = self.ranges.partition_point(|range| range.start <= ip);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (ip <= range.end).then(|| range.record.clone())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
network,country,city,latitude,longitude,organization
52.0.0.0/8,US,Ashburn,39.04,-77.48,Amazon.com
148.251.0.0/16,DE,Falkenstein,50.47,12.37,Hetzner Online GmbH
64.130.0.0/16,NL,,,,
52.10.0.0/16,IE,Dublin,53.33,-6.24,Amazon Ireland
";

    fn db() -> CsvGeoDatabase {
        CsvGeoDatabase::from_reader(csv::Reader::from_reader(TABLE.as_bytes())).unwrap()
    }

    #[test]
    fn test_lookup_hits_range() {
        let record = db().lookup("52.200.1.1".parse().unwrap()).unwrap();
        assert_eq!(record.country.as_deref(), Some("US"));
        assert_eq!(record.city.as_deref(), Some("Ashburn"));
        assert_eq!(record.coordinates, Some([39.04, -77.48]));
        assert_eq!(record.organization.as_deref(), Some("Amazon.com"));
    }

    #[test]
    fn test_empty_fields_are_absent() {
        let record = db().lookup("64.130.9.9".parse().unwrap()).unwrap();
        assert_eq!(record.country.as_deref(), Some("NL"));
        assert_eq!(record.city, None);
        assert_eq!(record.coordinates, None);
        assert_eq!(record.organization, None);
    }

    #[test]
    fn test_overlapping_range_is_dropped() {
        let db = db();
        assert_eq!(db.len(), 3);
        // 52.10.0.0/16 sits inside 52.0.0.0/8 and was ignored
        let record = db.lookup("52.10.1.1".parse().unwrap()).unwrap();
        assert_eq!(record.country.as_deref(), Some("US"));
    }

    #[test]
    fn test_lookup_misses() {
        let db = db();
        assert!(db.lookup("9.9.9.9".parse().unwrap()).is_none());
        assert!(db.lookup("1.1.1.1".parse().unwrap()).is_none());
        assert!(db.lookup("255.255.255.255".parse().unwrap()).is_none());
        assert!(db.lookup("2001:db8::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_invalid_network_reports_line() {
        let table = "network,country,city,latitude,longitude,organization\nnot-a-network,US,,,,\n";
        let err = CsvGeoDatabase::from_reader(csv::Reader::from_reader(table.as_bytes()))
            .unwrap_err();
        assert!(matches!(err, Error::GeoRow { row: 2, .. }));
    }
}
