//! Geographic coordinates and great-circle distance.
//!
//! A `Coord` is an immutable (latitude, longitude) pair in decimal degrees
//! with latitude in [-90, 90] and longitude in (-180, 180]. Distances are
//! computed with the spherical law of cosines, which agrees with Haversine
//! to five digits at the scales this system cares about.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Miles spanned by one degree of great-circle arc.
pub const MILES_PER_DEGREE: f64 = 69.172;

/// Mean Earth radius in miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    lat: f64,
    lon: f64,
}

impl Coord {
    /// Create a coordinate, validating the latitude range and wrapping the
    /// longitude into (-180, 180].
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            bail!("non-finite coordinate ({}, {})", lat, lon);
        }
        if !(-90.0..=90.0).contains(&lat) {
            bail!("latitude {} out of range [-90, 90]", lat);
        }
        let mut lon = lon % 360.0;
        if lon <= -180.0 {
            lon += 360.0;
        } else if lon > 180.0 {
            lon -= 360.0;
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Great-circle distance to `other` in miles.
    ///
    /// Spherical law of cosines; the cosine argument is clamped so that
    /// round-off on identical points cannot produce a NaN.
    pub fn distance_miles(&self, other: &Coord) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let cos_arc = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * dlon.cos();
        let arc = cos_arc.clamp(-1.0, 1.0).acos();
        arc * EARTH_RADIUS_MILES
    }

    /// Great-circle distance to `other` in degrees of arc.
    pub fn distance_degrees(&self, other: &Coord) -> f64 {
        self.distance_miles(other) / MILES_PER_DEGREE
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4},{:.4})", self.lat, self.lon)
    }
}

impl FromStr for Coord {
    type Err = anyhow::Error;

    /// Parse a `lat,lon` pair in decimal degrees.
    fn from_str(s: &str) -> Result<Self> {
        let Some((lat, lon)) = s.split_once(',') else {
            bail!("coordinate '{}' is not of the form lat,lon", s);
        };
        let lat: f64 = lat.trim().parse()?;
        let lon: f64 = lon.trim().parse()?;
        Coord::new(lat, lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_at_equator_is_about_69_miles() {
        let a = Coord::new(0.0, 0.0).unwrap();
        let b = Coord::new(0.0, 1.0).unwrap();
        let d = a.distance_miles(&b);
        assert!((d - 69.0).abs() < 0.5, "got {}", d);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = Coord::new(37.39, -122.08).unwrap();
        assert_eq!(a.distance_miles(&a), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Coord::new(30.0, 100.0).unwrap();
        let b = Coord::new(-45.0, -60.0).unwrap();
        assert!((a.distance_miles(&b) - b.distance_miles(&a)).abs() < 1e-9);
    }

    #[test]
    fn longitude_wraps_into_half_open_range() {
        let c = Coord::new(0.0, -180.0).unwrap();
        assert_eq!(c.lon(), 180.0);
        let c = Coord::new(0.0, 270.0).unwrap();
        assert_eq!(c.lon(), -90.0);
    }

    #[test]
    fn latitude_out_of_range_is_rejected() {
        assert!(Coord::new(90.5, 0.0).is_err());
        assert!(Coord::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn parse_lat_lon_pair() {
        let c: Coord = "48.8567,2.3508".parse().unwrap();
        assert!((c.lat() - 48.8567).abs() < 1e-9);
        assert!((c.lon() - 2.3508).abs() < 1e-9);
        assert!("48.8567".parse::<Coord>().is_err());
        assert!("x,y".parse::<Coord>().is_err());
    }

    #[test]
    fn antipodal_distance_is_half_circumference() {
        let a = Coord::new(0.0, 0.0).unwrap();
        let b = Coord::new(0.0, 180.0).unwrap();
        let d = a.distance_miles(&b);
        let half = std::f64::consts::PI * EARTH_RADIUS_MILES;
        assert!((d - half).abs() < 1e-6);
    }
}
