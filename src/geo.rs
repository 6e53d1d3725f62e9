//! IP geolocation for country tagging and proxy recommendation.
//!
//! Lookups come from an interval database loaded once at startup: each CSV
//! row maps a numeric IPv4 range to a country code and coordinates. The
//! row format is `startIpNum,endIpNum,country,lat,lon` with addresses as
//! network-order integers, the cut-down form of the public GeoLite2 city
//! exports. Everything stays in one sorted `Vec` and lookups binary-search.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("failed to read geo database: {0}")]
    Io(#[from] std::io::Error),
    #[error("geo database line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// ISO 3166 alpha-2 country code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    pub fn new(code: &str) -> Option<Self> {
        let bytes = code.as_bytes();
        match bytes {
            [a @ b'A'..=b'Z', b @ b'A'..=b'Z'] => Some(Self([*a, *b])),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees two ASCII uppercase bytes.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What we know about one address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IpInfo {
    pub country: CountryCode,
    pub lat: f64,
    pub lon: f64,
}

/// Resolves a remote address to location info, if known.
pub trait Geolocate: Send + Sync {
    fn locate(&self, addr: IpAddr) -> Option<IpInfo>;
}

#[derive(Debug)]
struct GeoRange {
    start: u32,
    end: u32,
    info: IpInfo,
}

/// Interval database over IPv4 space. IPv6 addresses (other than
/// v4-mapped ones) resolve to nothing.
#[derive(Debug)]
pub struct CsvGeolocate {
    ranges: Vec<GeoRange>,
}

impl CsvGeolocate {
    /// A database that knows no addresses.
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn load(path: &Path) -> Result<Self, GeoError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    fn parse(text: &str) -> Result<Self, GeoError> {
        let mut ranges = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Tolerate a header row.
            if index == 0 && !line.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let row = Self::parse_row(line).map_err(|reason| GeoError::Malformed {
                line: index + 1,
                reason,
            })?;
            if let Some(row) = row {
                ranges.push(row);
            }
        }
        ranges.sort_by_key(|range| range.start);
        Ok(Self { ranges })
    }

    fn parse_row(line: &str) -> Result<Option<GeoRange>, String> {
        let mut fields = line.split(',');
        let mut next = |name: &str| {
            fields
                .next()
                .map(str::trim)
                .ok_or_else(|| format!("missing {name} column"))
        };

        let start = next("start")?
            .parse::<u32>()
            .map_err(|err| format!("bad start address: {err}"))?;
        let end = next("end")?
            .parse::<u32>()
            .map_err(|err| format!("bad end address: {err}"))?;
        if end < start {
            return Err(format!("range ends before it starts ({end} < {start})"));
        }
        let country = next("country")?;
        let lat = next("lat")?;
        let lon = next("lon")?;
        // Rows without coordinates exist in the source data; skip them.
        if lat.is_empty() || lon.is_empty() {
            return Ok(None);
        }
        let country = CountryCode::new(country)
            .ok_or_else(|| format!("bad country code {country:?}"))?;
        let lat = lat
            .parse::<f64>()
            .map_err(|err| format!("bad latitude: {err}"))?;
        let lon = lon
            .parse::<f64>()
            .map_err(|err| format!("bad longitude: {err}"))?;
        Ok(Some(GeoRange {
            start,
            end,
            info: IpInfo { country, lat, lon },
        }))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl Geolocate for CsvGeolocate {
    fn locate(&self, addr: IpAddr) -> Option<IpInfo> {
        let v4 = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        let key = u32::from(v4);
        let index = self.ranges.partition_point(|range| range.start <= key);
        let range = self.ranges.get(index.checked_sub(1)?)?;
        (key <= range.end).then_some(range.info)
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two (lat, lon) points in kilometers.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let lat1 = a.0.to_radians();
    let lon1 = a.1.to_radians();
    let lat2 = b.0.to_radians();
    let lon2 = b.1.to_radians();

    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SAMPLE: &str = "\
startIpNum,endIpNum,country,lat,lon
16777216,16777471,AU,-33.494,143.2104
16777472,16778239,CN,34.7732,113.722
134744064,134744319,US,37.751,-97.822
";

    fn db() -> CsvGeolocate {
        CsvGeolocate::parse(SAMPLE).expect("parse")
    }

    #[test]
    fn locates_addresses_inside_ranges() {
        let db = db();
        assert_eq!(db.len(), 3);

        let info = db
            .locate(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
            .expect("known address");
        assert_eq!(info.country.as_str(), "US");
        assert!((info.lat - 37.751).abs() < 1e-9);

        let info = db
            .locate(IpAddr::V4(Ipv4Addr::new(1, 0, 0, 200)))
            .expect("known address");
        assert_eq!(info.country.as_str(), "AU");
    }

    #[test]
    fn misses_between_and_outside_ranges() {
        let db = db();
        assert!(db.locate(IpAddr::V4(Ipv4Addr::new(0, 255, 255, 255))).is_none());
        assert!(db.locate(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))).is_none());
        assert!(db.locate(IpAddr::V6(Ipv6Addr::LOCALHOST)).is_none());
    }

    #[test]
    fn v4_mapped_v6_addresses_hit_the_v4_table() {
        let db = db();
        let mapped = Ipv4Addr::new(8, 8, 8, 8).to_ipv6_mapped();
        let info = db.locate(IpAddr::V6(mapped)).expect("mapped lookup");
        assert_eq!(info.country.as_str(), "US");
    }

    #[test]
    fn rows_without_coordinates_are_skipped() {
        let db = CsvGeolocate::parse("1,10,FR,,\n20,30,DE,52.52,13.40\n").expect("parse");
        assert_eq!(db.len(), 1);
        assert!(db.locate(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 5))).is_none());
        assert!(db.locate(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 25))).is_some());
    }

    #[test]
    fn malformed_rows_name_the_line() {
        let err = CsvGeolocate::parse("1,10,FRA,1.0,2.0\n").expect_err("bad country");
        assert!(matches!(err, GeoError::Malformed { line: 1, .. }));

        let err = CsvGeolocate::parse("50,10,FR,1.0,2.0\n").expect_err("inverted range");
        assert!(matches!(err, GeoError::Malformed { line: 1, .. }));
    }

    #[test]
    fn haversine_matches_known_distances() {
        // London to Paris is about 344 km.
        let d = haversine_km((51.5074, -0.1278), (48.8566, 2.3522));
        assert!((d - 344.0).abs() < 5.0, "got {d}");
        assert_eq!(haversine_km((10.0, 20.0), (10.0, 20.0)), 0.0);
    }
}
