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

//! Synthetic craft injected into the relay for loopback testing.
//!
//! A phantom craft travels the same message path as a real one: it renders
//! a `CraftInfoAndPosition` on demand which is forwarded with the ordinary
//! other-craft-position message.

use geo;
use geo::GeoPoint;
use msp::messages::CraftInfoAndPosition;
use msp::GPS_FIX_3D;

/// A deliberately, ridiculously high satellite count, as a reminder that
/// the fix is synthetic.
pub const SYNTHETIC_SATELLITE_COUNT: u8 = 50;

// Phantom UIDs need entropy but not actual randomness; a fixed seed keeps
// any problem involving a phantom craft reproducible run to run.
const UID_SEED: u32 = 1729;

pub struct UidGenerator {
    state: u32,
}

impl UidGenerator {
    pub fn new() -> UidGenerator {
        UidGenerator { state: UID_SEED }
    }

    fn next_word(&mut self) -> u32 {
        // xorshift32
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;

        // keep phantom UIDs in the upper half of the space, clear of real boards
        u32::max_value() / 2 + x % (u32::max_value() / 2)
    }

    pub fn next_uid(&mut self) -> [u32; 3] {
        [self.next_word(), self.next_word(), self.next_word()]
    }
}

/// A phantom hovering at a fixed position. Imagine a perfect quad with
/// infinite battery life.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedCraft {
    pub craft_name: String,
    pub uid: [u32; 3],
    pub msp_lat: u32,
    pub msp_lon: u32,
    pub altitude_m: u16,
    pub speed: u16,
    pub course_decideg: u16,
}

impl FixedCraft {
    pub fn new(
        craft_name: &str,
        uid: [u32; 3],
        position: GeoPoint,
        altitude_m: u16,
        course_decideg: u16,
    ) -> FixedCraft {
        FixedCraft {
            craft_name: craft_name.to_string(),
            uid: uid,
            msp_lat: position.msp_lat(),
            msp_lon: position.msp_lon(),
            altitude_m: altitude_m,
            // not moving, so by definition speed is 0
            speed: 0,
            course_decideg: course_decideg,
        }
    }
}

/// A phantom that flies formation with a tracked real craft, offset by a
/// bearing (relative to the reference's ground course), a horizontal
/// distance and a relative altitude.
#[derive(Debug, Clone, PartialEq)]
pub struct WingmanCraft {
    pub craft_name: String,
    pub uid: [u32; 3],
    /// Port whose craft we shadow, or the literal "all".
    pub target_port: String,
    pub bearing_offset_deg: f64,
    pub distance_m: f64,
    pub relative_alt_m: f64,
    reference: Option<CraftInfoAndPosition>,
    reference_stale: bool,
}

impl WingmanCraft {
    pub fn new(
        target_port: &str,
        bearing_offset_deg: f64,
        distance_m: f64,
        relative_alt_m: f64,
        uid: [u32; 3],
    ) -> WingmanCraft {
        WingmanCraft {
            craft_name: format!("phwing_{}", target_port),
            uid: uid,
            target_port: target_port.to_string(),
            bearing_offset_deg: bearing_offset_deg,
            distance_m: distance_m,
            relative_alt_m: relative_alt_m,
            reference: None,
            reference_stale: false,
        }
    }

    fn position_from_reference(&self, reference: &CraftInfoAndPosition) -> CraftInfoAndPosition {
        // ground course comes in decidegrees; whole degrees are plenty here
        let course_deg = (reference.course_decideg / 10) as f64;
        let bearing = geo::normalize_bearing(course_deg + self.bearing_offset_deg);

        let start = GeoPoint::from_msp(reference.msp_lat, reference.msp_lon);
        let destination = geo::destination_point(&start, bearing, self.distance_m);

        // altitude is unsigned on the wire but signed in fact; the offset
        // math happens in signed space and the result is truncated back to
        // the wire representation bit-for-bit
        let altitude_m = (reference.altitude_m as i16 as f64 + self.relative_alt_m) as i16 as u16;

        CraftInfoAndPosition {
            uid: self.uid,
            fix_type: GPS_FIX_3D,
            num_sat: SYNTHETIC_SATELLITE_COUNT,
            msp_lat: destination.msp_lat(),
            msp_lon: destination.msp_lon(),
            altitude_m: altitude_m,
            // we track the reference craft in speed and ground course exactly
            speed: reference.speed,
            course_decideg: reference.course_decideg,
            craft_name: self.craft_name.clone(),
        }
    }
}

pub enum PhantomCraft {
    Fixed(FixedCraft),
    Wingman(WingmanCraft),
}

impl PhantomCraft {
    pub fn craft_name(&self) -> &str {
        match *self {
            PhantomCraft::Fixed(ref fixed) => &fixed.craft_name,
            PhantomCraft::Wingman(ref wingman) => &wingman.craft_name,
        }
    }

    /// Parameter dump for the startup log.
    pub fn parameters_string(&self) -> String {
        match *self {
            PhantomCraft::Fixed(ref fixed) => format!(
                "{} at {}, alt {} meters, course {} decidegrees",
                fixed.craft_name,
                geo::lat_lon_string(false, fixed.msp_lat, fixed.msp_lon),
                fixed.altitude_m as i16,
                fixed.course_decideg
            ),
            PhantomCraft::Wingman(ref wingman) => format!(
                "Port {}, {} deg rotation, {} meters distant, {} meters alt difference",
                wingman.target_port,
                wingman.bearing_offset_deg,
                wingman.distance_m,
                wingman.relative_alt_m
            ),
        }
    }

    /// Store the latest reference craft position. Fixed craft ignore it.
    pub fn update_reference(&mut self, reference: &CraftInfoAndPosition, position_is_stale: bool) {
        match *self {
            PhantomCraft::Fixed(_) => {}
            PhantomCraft::Wingman(ref mut wingman) => {
                wingman.reference = Some(reference.clone());
                wingman.reference_stale = position_is_stale;
            }
        }
    }

    /// Is this phantom currently eligible to be sent to the given port?
    /// On refusal the error carries the reason, for the skip log line.
    pub fn eligibility(&self, port_name: &str) -> Result<(), String> {
        match *self {
            // fixed craft have no port affiliation, so always eligible
            PhantomCraft::Fixed(_) => Ok(()),
            PhantomCraft::Wingman(ref wingman) => {
                let port_matches = port_name.eq_ignore_ascii_case(&wingman.target_port)
                    || wingman.target_port.eq_ignore_ascii_case("all");

                if !port_matches {
                    return Err(format!(
                        "target port {} does not match {}",
                        wingman.target_port, port_name
                    ));
                }
                if wingman.reference.is_none() {
                    return Err(String::from("reference craft position never received"));
                }
                if wingman.reference_stale {
                    return Err(String::from("reference craft position is stale"));
                }

                Ok(())
            }
        }
    }

    /// Current position, computed on demand. `None` when the craft has
    /// nothing valid to report.
    pub fn current_position(&self) -> Option<CraftInfoAndPosition> {
        match *self {
            PhantomCraft::Fixed(ref fixed) => Some(CraftInfoAndPosition {
                uid: fixed.uid,
                fix_type: GPS_FIX_3D,
                num_sat: SYNTHETIC_SATELLITE_COUNT,
                msp_lat: fixed.msp_lat,
                msp_lon: fixed.msp_lon,
                altitude_m: fixed.altitude_m,
                speed: fixed.speed,
                course_decideg: fixed.course_decideg,
                craft_name: fixed.craft_name.clone(),
            }),
            PhantomCraft::Wingman(ref wingman) => {
                if wingman.reference_stale {
                    return None;
                }

                match wingman.reference {
                    Some(ref reference) => Some(wingman.position_from_reference(reference)),
                    None => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_craft(course_decideg: u16, altitude_m: u16) -> CraftInfoAndPosition {
        CraftInfoAndPosition {
            uid: [1, 2, 3],
            fix_type: GPS_FIX_3D,
            num_sat: 9,
            msp_lat: 394907560,
            msp_lon: (-1050815770_i32) as u32,
            altitude_m: altitude_m,
            speed: 210,
            course_decideg: course_decideg,
            craft_name: String::from("RefQuad"),
        }
    }

    #[test]
    fn test_uid_generator_is_deterministic() {
        let mut a = UidGenerator::new();
        let mut b = UidGenerator::new();

        let first = a.next_uid();
        assert_eq!(first, b.next_uid());
        assert!(a.next_uid() != first);

        // phantom UIDs live in the upper half of the u32 space
        for word in &first {
            assert!(*word >= u32::max_value() / 2);
        }
    }

    #[test]
    fn test_fixed_craft_always_eligible_and_immobile() {
        let mut phantom = PhantomCraft::Fixed(FixedCraft::new(
            "FakeCofpv_01",
            [777, 888, 999],
            GeoPoint::from_degrees(39.490756, -105.081577),
            5,
            450,
        ));

        assert!(phantom.eligibility("com20").is_ok());
        assert!(phantom.eligibility("anything").is_ok());

        let before = phantom.current_position().unwrap();
        phantom.update_reference(&reference_craft(1800, 100), false);
        let after = phantom.current_position().unwrap();

        assert_eq!(before, after);
        assert_eq!(before.num_sat, SYNTHETIC_SATELLITE_COUNT);
        assert_eq!(before.fix_type, GPS_FIX_3D);
        assert_eq!(before.speed, 0);
        assert_eq!(before.craft_name, "FakeCofpv_01");
    }

    #[test]
    fn test_wingman_port_matching() {
        let phantom = PhantomCraft::Wingman(WingmanCraft::new("com20", 90.0, 100.0, -35.0, [7; 3]));

        assert!(phantom.eligibility("com4").is_err());
        // port comparison ignores case, but both still need a reference
        assert_eq!(
            phantom.eligibility("COM20"),
            Err(String::from("reference craft position never received"))
        );

        let all = PhantomCraft::Wingman(WingmanCraft::new("ALL", 90.0, 100.0, -35.0, [7; 3]));
        assert_eq!(
            all.eligibility("com48"),
            Err(String::from("reference craft position never received"))
        );
    }

    #[test]
    fn test_wingman_needs_fresh_reference() {
        let mut phantom =
            PhantomCraft::Wingman(WingmanCraft::new("com20", 90.0, 100.0, -35.0, [7; 3]));

        assert!(phantom.current_position().is_none());

        phantom.update_reference(&reference_craft(0, 100), true);
        assert!(phantom.eligibility("com20").is_err());
        assert!(phantom.current_position().is_none());

        phantom.update_reference(&reference_craft(0, 100), false);
        assert!(phantom.eligibility("com20").is_ok());
        assert!(phantom.current_position().is_some());
    }

    #[test]
    fn test_wingman_position_offset_east() {
        // reference flying due north; wingman 90 degrees right, 100 m out,
        // 35 m below
        let mut phantom =
            PhantomCraft::Wingman(WingmanCraft::new("com20", 90.0, 100.0, -35.0, [7; 3]));
        let reference = reference_craft(0, 100);
        phantom.update_reference(&reference, false);

        let position = phantom.current_position().unwrap();

        let start = GeoPoint::from_msp(reference.msp_lat, reference.msp_lon);
        let expected = geo::destination_point(&start, 90.0, 100.0);
        assert_eq!(position.msp_lat, expected.msp_lat());
        assert_eq!(position.msp_lon, expected.msp_lon());

        assert_eq!(position.altitude_m, 65);
        assert_eq!(position.speed, reference.speed);
        assert_eq!(position.course_decideg, reference.course_decideg);
        assert_eq!(position.num_sat, SYNTHETIC_SATELLITE_COUNT);
        assert_eq!(position.craft_name, "phwing_com20");
    }

    #[test]
    fn test_wingman_bearing_tracks_reference_course() {
        // reference flying due east (900 decidegrees); +90 offset puts the
        // wingman due south of it
        let mut phantom =
            PhantomCraft::Wingman(WingmanCraft::new("com20", 90.0, 100.0, 0.0, [7; 3]));
        let reference = reference_craft(900, 100);
        phantom.update_reference(&reference, false);

        let position = phantom.current_position().unwrap();
        let start = GeoPoint::from_msp(reference.msp_lat, reference.msp_lon);
        let expected = geo::destination_point(&start, 180.0, 100.0);

        assert_eq!(position.msp_lat, expected.msp_lat());
        assert_eq!(position.msp_lon, expected.msp_lon());
    }

    #[test]
    fn test_wingman_altitude_keeps_negative_bit_pattern() {
        // 10 m reference minus 35 m offset goes below zero; the wire sees
        // the two's complement bits
        let mut phantom =
            PhantomCraft::Wingman(WingmanCraft::new("com20", 0.0, 50.0, -35.0, [7; 3]));
        phantom.update_reference(&reference_craft(0, 10), false);

        let position = phantom.current_position().unwrap();
        assert_eq!(position.altitude_m, (-25_i16) as u16);
        assert_eq!(position.altitude_m as i16, -25);
    }

    #[test]
    fn test_wingman_course_uses_integer_decidegree_division() {
        // 457 decidegrees floors to 45 whole degrees before the offset is
        // applied, matching the controller-side convention
        let mut phantom =
            PhantomCraft::Wingman(WingmanCraft::new("com20", 0.0, 100.0, 0.0, [7; 3]));
        let reference = reference_craft(457, 100);
        phantom.update_reference(&reference, false);

        let position = phantom.current_position().unwrap();
        let start = GeoPoint::from_msp(reference.msp_lat, reference.msp_lon);
        let expected = geo::destination_point(&start, 45.0, 100.0);

        assert_eq!(position.msp_lat, expected.msp_lat());
        assert_eq!(position.msp_lon, expected.msp_lon());
    }
}
