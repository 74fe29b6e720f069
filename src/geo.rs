// CraftServices - a ground-side MSP position relay for small unmanned aircraft
// Copyright (C) 2018-2019  CraftServices contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Geospatial math on MSP-native coordinates.
//!
//! MSP transports latitude and longitude as signed 32-bit integers equal
//! to decimal degrees times 10^7, carried as unsigned on the wire.

use msp::{GPS_FIX_2D, GPS_FIX_3D, GPS_FIX_NONE};

pub const GPS_DEGREES_DIVIDER: f64 = 10_000_000.0;
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A point on the globe in decimal degrees.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct GeoPoint {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

impl GeoPoint {
    pub fn from_degrees(lat_deg: f64, lon_deg: f64) -> GeoPoint {
        GeoPoint {
            lat_deg: lat_deg,
            lon_deg: lon_deg,
        }
    }

    pub fn from_msp(msp_lat: u32, msp_lon: u32) -> GeoPoint {
        GeoPoint {
            lat_deg: msp_to_degrees(msp_lat),
            lon_deg: msp_to_degrees(msp_lon),
        }
    }

    pub fn msp_lat(&self) -> u32 {
        degrees_to_msp(self.lat_deg)
    }

    pub fn msp_lon(&self) -> u32 {
        degrees_to_msp(self.lon_deg)
    }
}

pub fn msp_to_degrees(msp_value: u32) -> f64 {
    (msp_value as i32) as f64 / GPS_DEGREES_DIVIDER
}

/// Truncating cast through i32 so negative degrees keep their wire bits.
pub fn degrees_to_msp(degrees: f64) -> u32 {
    (degrees * GPS_DEGREES_DIVIDER) as i32 as u32
}

/// Normalize a degree rotation to [0, 360).
pub fn normalize_bearing(rotation_deg: f64) -> f64 {
    let adjusted = rotation_deg % 360.0;
    if adjusted < 0.0 {
        adjusted + 360.0
    } else {
        adjusted
    }
}

/// Great-circle destination point.
///
/// sinφ2 = sinφ1⋅cosδ + cosφ1⋅sinδ⋅cosθ
/// tanΔλ = sinθ⋅sinδ⋅cosφ1 / (cosδ − sinφ1⋅sinφ2)
/// see mathforum.org/library/drmath/view/52049.html for derivation
pub fn destination_point(start: &GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    // angular distance in radians
    let delta = distance_m / EARTH_RADIUS_METERS;
    let theta = bearing_deg.to_radians();

    let phi1 = start.lat_deg.to_radians();
    let lambda1 = start.lon_deg.to_radians();

    let sin_phi2 = phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos();
    let phi2 = sin_phi2.asin();
    let y = theta.sin() * delta.sin() * phi1.cos();
    let x = delta.cos() - phi1.sin() * sin_phi2;
    let lambda2 = lambda1 + y.atan2(x);

    // normalize longitude to -180..+180
    let lon_deg = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;

    GeoPoint {
        lat_deg: phi2.to_degrees(),
        lon_deg: lon_deg,
    }
}

/// Lat/lon for log output. Some GPSes report zeros before they have a fix
/// and we let that leak through the redaction; it is helpful and reveals
/// no position.
pub fn lat_lon_string(omit_gps_pos: bool, msp_lat: u32, msp_lon: u32) -> String {
    if omit_gps_pos && (msp_lat != 0 || msp_lon != 0) {
        return String::from("XX.XXXX, YY.YYYY");
    }

    format!(
        "{:.7}, {:.7}",
        msp_to_degrees(msp_lat),
        msp_to_degrees(msp_lon)
    )
}

pub fn decidegree_string(decidegrees: i16) -> String {
    format!("{} deg", decidegrees / 10)
}

pub fn hdop_string(hdop: u16) -> String {
    format!("{}", hdop as f32 / 100.0)
}

pub fn fix_type_string(fix_type: u8) -> &'static str {
    match fix_type {
        GPS_FIX_NONE => "No Fix",
        GPS_FIX_2D => "2D Fix",
        GPS_FIX_3D => "3D Fix",
        _ => "Unknown Fix",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn haversine_distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
        let phi1 = a.lat_deg.to_radians();
        let phi2 = b.lat_deg.to_radians();
        let d_phi = (b.lat_deg - a.lat_deg).to_radians();
        let d_lambda = (b.lon_deg - a.lon_deg).to_radians();

        let h = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);

        2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
    }

    #[test]
    fn test_msp_degree_conversion() {
        assert_eq!(msp_to_degrees(394907560), 39.490756);
        // exactly representable degree values convert without truncation slop
        assert_eq!(degrees_to_msp(39.5), 395000000);

        // negative longitude keeps its signed bit pattern
        let msp_lon = (-1050815770_i32) as u32;
        assert_eq!(msp_to_degrees(msp_lon), -105.081577);
        assert_eq!(degrees_to_msp(-105.25), (-1052500000_i32) as u32);
    }

    #[test]
    fn test_geo_point_msp_round_trip() {
        // the float detour may truncate one count low, never more
        let point = GeoPoint::from_msp(394907560, (-1050815770_i32) as u32);
        assert!((point.msp_lat() as i32 - 394907560).abs() <= 1);
        assert!((point.msp_lon() as i32 - -1050815770).abs() <= 1);
    }

    #[test]
    fn test_normalize_bearing() {
        assert_eq!(normalize_bearing(0.0), 0.0);
        assert_eq!(normalize_bearing(359.0), 359.0);
        assert_eq!(normalize_bearing(360.0), 0.0);
        assert_eq!(normalize_bearing(450.0), 90.0);
        assert_eq!(normalize_bearing(-90.0), 270.0);
        assert_eq!(normalize_bearing(-360.0), 0.0);
        assert_eq!(normalize_bearing(725.0), 5.0);
    }

    #[test]
    fn test_destination_zero_distance_is_identity() {
        let start = GeoPoint::from_degrees(39.490756, -105.081577);

        for bearing in &[0.0, 45.0, 90.0, 180.0, 270.0] {
            let dest = destination_point(&start, *bearing, 0.0);
            assert!((dest.lat_deg - start.lat_deg).abs() < 1e-9);
            assert!((dest.lon_deg - start.lon_deg).abs() < 1e-9);
        }
    }

    #[test]
    fn test_destination_distance_round_trip() {
        let start = GeoPoint::from_degrees(39.490756, -105.081577);

        for &(bearing, distance) in &[
            (0.0, 100.0),
            (90.0, 100.0),
            (135.0, 1000.0),
            (271.5, 10_000.0),
        ] {
            let dest = destination_point(&start, bearing, distance);
            let measured = haversine_distance_m(&start, &dest);
            assert!(
                (measured - distance).abs() < 1.0,
                "bearing {} distance {} measured {}",
                bearing,
                distance,
                measured
            );
        }
    }

    #[test]
    fn test_destination_due_east_moves_only_longitude() {
        let start = GeoPoint::from_degrees(39.490756, -105.081577);
        let dest = destination_point(&start, 90.0, 100.0);

        assert!(dest.lon_deg > start.lon_deg);
        // a 100 m hop due east barely moves latitude
        assert!((dest.lat_deg - start.lat_deg).abs() < 1e-5);
    }

    #[test]
    fn test_destination_longitude_normalized_across_antimeridian() {
        let start = GeoPoint::from_degrees(0.0, 179.9999);
        let dest = destination_point(&start, 90.0, 10_000.0);

        assert!(dest.lon_deg > -180.0 && dest.lon_deg <= 180.0);
        assert!(dest.lon_deg < 0.0);
    }

    #[test]
    fn test_lat_lon_string_redaction() {
        assert_eq!(
            lat_lon_string(false, 394907560, (-1050815770_i32) as u32),
            "39.4907560, -105.0815770"
        );
        assert_eq!(
            lat_lon_string(true, 394907560, (-1050815770_i32) as u32),
            "XX.XXXX, YY.YYYY"
        );
        // zeros leak through the redaction on purpose
        assert_eq!(lat_lon_string(true, 0, 0), "0.0000000, 0.0000000");
    }

    #[test]
    fn test_decidegree_string() {
        assert_eq!(decidegree_string(450), "45 deg");
        assert_eq!(decidegree_string(0), "0 deg");
        assert_eq!(decidegree_string(-350), "-35 deg");
    }

    #[test]
    fn test_hdop_string() {
        assert_eq!(hdop_string(120), "1.2");
        assert_eq!(hdop_string(100), "1");
    }

    #[test]
    fn test_fix_type_string() {
        assert_eq!(fix_type_string(0), "No Fix");
        assert_eq!(fix_type_string(1), "2D Fix");
        assert_eq!(fix_type_string(2), "3D Fix");
        assert_eq!(fix_type_string(9), "Unknown Fix");
    }
}
