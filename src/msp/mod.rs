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

//! MSP V2 wire protocol: framing constants, message ids, codec, parser
//! and the typed message catalog.

pub mod codec;
pub mod messages;
pub mod parser;

pub const PREAMBLE_ONE: u8 = b'$';
// 'X' is used in MSP V2 instead of 'M' in MSP V1. We only speak V2.
pub const PREAMBLE_TWO: u8 = b'X';

pub const DIRECTION_TO_FC: u8 = b'<';
pub const DIRECTION_FROM_FC: u8 = b'>';
pub const DIRECTION_ERROR: u8 = b'!';

// Unused flag byte, always 0 at present
pub const ZERO_FLAG: u8 = 0;

pub const MSP_API_VERSION: u16 = 1;
pub const MSP_FC_VARIANT: u16 = 2;
pub const MSP_NAME: u16 = 10;
pub const MSP_RAW_GPS: u16 = 106;
pub const MSP_UID: u16 = 160;
// Settings the flight controller has for receiving other-craft position updates
pub const MSP2_INAV_OTHER_CRAFT_POSITION_SETTING: u16 = 0x201A;
// A position message for a single other craft
pub const MSP2_INAV_OTHER_CRAFT_POSITION: u16 = 0x201B;

pub const GPS_FIX_NONE: u8 = 0;
pub const GPS_FIX_2D: u8 = 1;
pub const GPS_FIX_3D: u8 = 2;

/// A framing-validated MSP V2 message as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub direction: u8,
    pub id: u16,
    pub payload: Vec<u8>,
}
