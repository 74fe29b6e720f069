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

//! The typed catalog of MSP messages this relay speaks.
//!
//! Message definitions follow the MultiWii serial protocol wiki and the
//! iNav source. Fields that are semantically signed (lat, lon, altitude)
//! are kept in their unsigned wire representation so the relay forwards
//! them bit-exactly between flight controllers; only log output
//! reinterprets them.

use std::fmt;

use nom::{le_u16, le_u32, le_u8, rest, IResult};

use geo;
use geo::GeoPoint;
use msp::codec::{message_crc, serialize_u16, serialize_u32, serialize_u8};
use msp::{DIRECTION_TO_FC, MSP2_INAV_OTHER_CRAFT_POSITION, MSP2_INAV_OTHER_CRAFT_POSITION_SETTING,
          MSP_API_VERSION, MSP_RAW_GPS, MSP_UID, PREAMBLE_ONE, PREAMBLE_TWO, ZERO_FLAG};

/// We cannot work with any MSP protocol version besides this.
pub const EXPECTED_MSP_PROTOCOL_VERSION: u8 = 0;
/// Minimum API version that carries the other-craft-position messages.
pub const MIN_API_MAJOR_FOR_OTHER_CRAFT: u8 = 2;
pub const MIN_API_MINOR_FOR_OTHER_CRAFT: u8 = 3;

#[derive(Debug, PartialEq)]
pub enum MessageError {
    SizeMismatch {
        id: u16,
        expected: usize,
        actual: usize,
    },
    Malformed(u16),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MessageError::SizeMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "message 0x{:04x} payload size mismatch, expected {} bytes but got {}",
                id, expected, actual
            ),
            MessageError::Malformed(id) => write!(f, "message 0x{:04x} payload is malformed", id),
        }
    }
}

/// Build an outgoing ground-to-controller frame around a payload.
pub fn build_frame(id: u16, payload: &[u8]) -> Vec<u8> {
    build_frame_with_direction(DIRECTION_TO_FC, id, payload)
}

pub fn build_frame_with_direction(direction: u8, id: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(9 + payload.len());

    msg.push(PREAMBLE_ONE);
    msg.push(PREAMBLE_TWO);
    msg.push(direction);
    msg.push(ZERO_FLAG);
    msg.push((id & 0xFF) as u8);
    msg.push((id >> 8) as u8);

    let len = payload.len() as u16;
    msg.push((len & 0xFF) as u8);
    msg.push((len >> 8) as u8);
    msg.extend_from_slice(payload);

    msg.push(message_crc(ZERO_FLAG, id, payload));

    msg
}

// MSP_API_VERSION: 1
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct ApiVersion {
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
}

impl ApiVersion {
    pub const PAYLOAD_LEN: usize = 3;

    pub fn decode(payload: &[u8]) -> Result<ApiVersion, MessageError> {
        if payload.len() != ApiVersion::PAYLOAD_LEN {
            return Err(MessageError::SizeMismatch {
                id: MSP_API_VERSION,
                expected: ApiVersion::PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        Ok(ApiVersion {
            protocol: payload[0],
            major: payload[1],
            minor: payload[2],
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        vec![self.protocol, self.major, self.minor]
    }

    /// Does this controller's API carry the other-craft-position messages?
    pub fn has_other_craft_messages(&self) -> bool {
        self.protocol == EXPECTED_MSP_PROTOCOL_VERSION
            && (self.major > MIN_API_MAJOR_FOR_OTHER_CRAFT
                || (self.major == MIN_API_MAJOR_FOR_OTHER_CRAFT
                    && self.minor >= MIN_API_MINOR_FOR_OTHER_CRAFT))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Protocol Version: {} - API Version: {}.{}",
            self.protocol, self.major, self.minor
        )
    }
}

// MSP_FC_VARIANT: 2
#[derive(Debug, PartialEq, Clone)]
pub struct FcVariant {
    /// e.g. "INAV"
    pub identifier: String,
}

impl FcVariant {
    pub fn decode(payload: &[u8]) -> Result<FcVariant, MessageError> {
        Ok(FcVariant {
            identifier: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        self.identifier.as_bytes().to_vec()
    }
}

// MSP_NAME: 10
#[derive(Debug, PartialEq, Clone)]
pub struct CraftName {
    /// e.g. "Bob's Quad"
    pub name: String,
}

impl CraftName {
    pub fn decode(payload: &[u8]) -> Result<CraftName, MessageError> {
        Ok(CraftName {
            name: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }
}

// MSP_RAW_GPS: 106
//
// Lat, lon and altitude are actually signed on the controller side but the
// native wire format is unsigned; we keep them as received.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct RawGps {
    pub fix_type: u8,
    pub num_sat: u8,
    pub msp_lat: u32,
    pub msp_lon: u32,
    pub altitude_m: u16,
    pub speed: u16,
    /// GPS heading; may be meaningless until the craft is actually moving.
    pub course_decideg: u16,
    pub hdop: u16,
}

impl RawGps {
    pub const PAYLOAD_LEN: usize = 18;

    pub fn zeroed() -> RawGps {
        RawGps {
            fix_type: 0,
            num_sat: 0,
            msp_lat: 0,
            msp_lon: 0,
            altitude_m: 0,
            speed: 0,
            course_decideg: 0,
            hdop: 0,
        }
    }

    fn from_wire(fields: (u8, u8, u32, u32, u16, u16, u16, u16)) -> RawGps {
        let (fix_type, num_sat, msp_lat, msp_lon, altitude_m, speed, course_decideg, hdop) = fields;

        RawGps {
            fix_type: fix_type,
            num_sat: num_sat,
            msp_lat: msp_lat,
            msp_lon: msp_lon,
            altitude_m: altitude_m,
            speed: speed,
            course_decideg: course_decideg,
            hdop: hdop,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<RawGps, MessageError> {
        if payload.len() != RawGps::PAYLOAD_LEN {
            return Err(MessageError::SizeMismatch {
                id: MSP_RAW_GPS,
                expected: RawGps::PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        match parse_raw_gps(payload) {
            IResult::Done(rem, gps) => {
                debug_assert!(rem.is_empty());
                Ok(gps)
            }
            _ => Err(MessageError::Malformed(MSP_RAW_GPS)),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(RawGps::PAYLOAD_LEN);

        serialize_u8(self.fix_type, &mut payload);
        serialize_u8(self.num_sat, &mut payload);
        serialize_u32(self.msp_lat, &mut payload);
        serialize_u32(self.msp_lon, &mut payload);
        serialize_u16(self.altitude_m, &mut payload);
        serialize_u16(self.speed, &mut payload);
        serialize_u16(self.course_decideg, &mut payload);
        serialize_u16(self.hdop, &mut payload);

        payload
    }
}

named!(parse_raw_gps<RawGps>,
    map!(
        do_parse!(
            fix_type: le_u8 >>
            num_sat: le_u8 >>
            msp_lat: le_u32 >>
            msp_lon: le_u32 >>
            altitude_m: le_u16 >>
            speed: le_u16 >>
            course_decideg: le_u16 >>
            hdop: le_u16 >>
            (fix_type, num_sat, msp_lat, msp_lon, altitude_m, speed, course_decideg, hdop)
        ),
        RawGps::from_wire
    )
);

// MSP_UID: 160
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Uid {
    pub uid: [u32; 3],
}

impl Uid {
    pub const PAYLOAD_LEN: usize = 12;

    fn from_wire(words: (u32, u32, u32)) -> Uid {
        Uid {
            uid: [words.0, words.1, words.2],
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Uid, MessageError> {
        if payload.len() != Uid::PAYLOAD_LEN {
            return Err(MessageError::SizeMismatch {
                id: MSP_UID,
                expected: Uid::PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        match parse_uid(payload) {
            IResult::Done(rem, uid) => {
                debug_assert!(rem.is_empty());
                Ok(uid)
            }
            _ => Err(MessageError::Malformed(MSP_UID)),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Uid::PAYLOAD_LEN);

        serialize_u32(self.uid[0], &mut payload);
        serialize_u32(self.uid[1], &mut payload);
        serialize_u32(self.uid[2], &mut payload);

        payload
    }
}

named!(parse_uid<Uid>,
    map!(
        do_parse!(
            uid_0: le_u32 >>
            uid_1: le_u32 >>
            uid_2: le_u32 >>
            (uid_0, uid_1, uid_2)
        ),
        Uid::from_wire
    )
);

// MSP2_INAV_OTHER_CRAFT_POSITION_SETTING: 0x201A
//
// The controller answers whether it wants forwarded positions. When the
// ground side sends this as a query it always reports `false` for its own
// wishes; it is just a way to prompt the controller into replying with its
// setting.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct OtherCraftPositionSetting {
    pub should_send_updates: bool,
}

impl OtherCraftPositionSetting {
    pub const PAYLOAD_LEN: usize = 1;

    pub fn decode(payload: &[u8]) -> Result<OtherCraftPositionSetting, MessageError> {
        if payload.len() != OtherCraftPositionSetting::PAYLOAD_LEN {
            return Err(MessageError::SizeMismatch {
                id: MSP2_INAV_OTHER_CRAFT_POSITION_SETTING,
                expected: OtherCraftPositionSetting::PAYLOAD_LEN,
                actual: payload.len(),
            });
        }

        Ok(OtherCraftPositionSetting {
            should_send_updates: payload[0] != 0,
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        vec![self.should_send_updates as u8]
    }
}

// MSP2_INAV_OTHER_CRAFT_POSITION: 0x201B
//
// The unit of information forwarded between craft: a 28 byte fixed prefix
// followed by the craft name, which runs to the end of the payload with no
// length prefix. The controller acknowledges receipt with an empty payload.
#[derive(Debug, PartialEq, Clone)]
pub struct CraftInfoAndPosition {
    pub uid: [u32; 3],
    pub fix_type: u8,
    pub num_sat: u8,
    pub msp_lat: u32,
    pub msp_lon: u32,
    pub altitude_m: u16,
    pub speed: u16,
    pub course_decideg: u16,
    pub craft_name: String,
}

impl CraftInfoAndPosition {
    pub const FIXED_PREFIX_LEN: usize = 28;

    fn from_wire(
        fields: (u32, u32, u32, u8, u8, u32, u32, u16, u16, u16, &[u8]),
    ) -> CraftInfoAndPosition {
        let (uid_0, uid_1, uid_2, fix_type, num_sat, msp_lat, msp_lon, altitude_m, speed,
             course_decideg, name) = fields;

        CraftInfoAndPosition {
            uid: [uid_0, uid_1, uid_2],
            fix_type: fix_type,
            num_sat: num_sat,
            msp_lat: msp_lat,
            msp_lon: msp_lon,
            altitude_m: altitude_m,
            speed: speed,
            course_decideg: course_decideg,
            craft_name: String::from_utf8_lossy(name).into_owned(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<CraftInfoAndPosition, MessageError> {
        if payload.len() < CraftInfoAndPosition::FIXED_PREFIX_LEN {
            return Err(MessageError::SizeMismatch {
                id: MSP2_INAV_OTHER_CRAFT_POSITION,
                expected: CraftInfoAndPosition::FIXED_PREFIX_LEN,
                actual: payload.len(),
            });
        }

        match parse_craft_info(payload) {
            IResult::Done(rem, info) => {
                debug_assert!(rem.is_empty());
                Ok(info)
            }
            _ => Err(MessageError::Malformed(MSP2_INAV_OTHER_CRAFT_POSITION)),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(CraftInfoAndPosition::FIXED_PREFIX_LEN + self.craft_name.len());

        serialize_u32(self.uid[0], &mut payload);
        serialize_u32(self.uid[1], &mut payload);
        serialize_u32(self.uid[2], &mut payload);

        serialize_u8(self.fix_type, &mut payload);
        serialize_u8(self.num_sat, &mut payload);
        serialize_u32(self.msp_lat, &mut payload);
        serialize_u32(self.msp_lon, &mut payload);
        serialize_u16(self.altitude_m, &mut payload);
        serialize_u16(self.speed, &mut payload);
        serialize_u16(self.course_decideg, &mut payload);

        // goes last since it is variable in size
        payload.extend_from_slice(self.craft_name.as_bytes());

        payload
    }

    pub fn geo_point(&self) -> GeoPoint {
        GeoPoint::from_msp(self.msp_lat, self.msp_lon)
    }

    /// Craft name plus position, with the position redacted when asked.
    pub fn location_string(&self, omit_gps_pos: bool) -> String {
        format!(
            "{} {}",
            self.craft_name,
            geo::lat_lon_string(omit_gps_pos, self.msp_lat, self.msp_lon)
        )
    }
}

named!(parse_craft_info<CraftInfoAndPosition>,
    map!(
        do_parse!(
            uid_0: le_u32 >>
            uid_1: le_u32 >>
            uid_2: le_u32 >>
            fix_type: le_u8 >>
            num_sat: le_u8 >>
            msp_lat: le_u32 >>
            msp_lon: le_u32 >>
            altitude_m: le_u16 >>
            speed: le_u16 >>
            course_decideg: le_u16 >>
            name: rest >>
            (uid_0, uid_1, uid_2, fix_type, num_sat, msp_lat, msp_lon, altitude_m, speed,
             course_decideg, name)
        ),
        CraftInfoAndPosition::from_wire
    )
);
