use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A point on the map
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees
    pub lat: f32,
    /// Longitude in degrees
    pub lng: f32,
}

impl Coordinate {
    pub fn new(lat: f32, lng: f32) -> Self {
        Self { lat, lng }
    }
}

/// Maps an address to where it is on the map
pub trait CoordinateResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<Coordinate>;
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u128,
    end: u128,
    coordinate: Coordinate,
}

/// In-memory table of inclusive address ranges, kept sorted for binary search.
///
/// IPv4 and IPv6 ranges live in separate tables; ranges must not overlap.
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    v4: Vec<Range>,
    v6: Vec<Range>,
}

impl RangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `start..=end`. Returns false, leaving the table unchanged, when the
    /// bounds are of different families, reversed, or overlap an existing range.
    pub fn insert(&mut self, start: IpAddr, end: IpAddr, coordinate: Coordinate) -> bool {
        let (table, start, end) = match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => (&mut self.v4, u32::from(s) as u128, u32::from(e) as u128),
            (IpAddr::V6(s), IpAddr::V6(e)) => (&mut self.v6, u128::from(s), u128::from(e)),
            _ => return false,
        };
        if start > end {
            return false;
        }

        let at = table.partition_point(|r| r.start < start);
        let overlaps_prev = at > 0 && table[at - 1].end >= start;
        let overlaps_next = table.get(at).is_some_and(|r| r.start <= end);
        if overlaps_prev || overlaps_next {
            return false;
        }

        table.insert(at, Range { start, end, coordinate });
        true
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CoordinateResolver for RangeTable {
    fn resolve(&self, ip: IpAddr) -> Option<Coordinate> {
        let (table, key) = match ip {
            IpAddr::V4(v4) => (&self.v4, u32::from(v4) as u128),
            // v4-mapped addresses are looked up as IPv4
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => (&self.v4, u32::from(v4) as u128),
                None => (&self.v6, u128::from(v6)),
            },
        };

        let at = table.partition_point(|r| r.start <= key);
        let range = table.get(at.checked_sub(1)?)?;
        (key <= range.end).then_some(range.coordinate)
    }
}

impl<R: CoordinateResolver + ?Sized> CoordinateResolver for std::sync::Arc<R> {
    fn resolve(&self, ip: IpAddr) -> Option<Coordinate> {
        (**self).resolve(ip)
    }
}
