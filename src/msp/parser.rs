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

//! Byte-at-a-time MSP V2 frame parser.
//!
//! The serial layer hands the parser one byte per read completion; the
//! parser either asks for more, emits a CRC-validated [`Frame`], or
//! reports a framing error and returns to the hunt for the next preamble.

use std::fmt;
use std::mem;

use msp::codec::message_crc;
use msp::{Frame, DIRECTION_ERROR, DIRECTION_FROM_FC, DIRECTION_TO_FC, PREAMBLE_ONE, PREAMBLE_TWO,
          ZERO_FLAG};

#[derive(Debug, PartialEq, Copy, Clone)]
enum ReadState {
    /// Expecting preamble character 1 ('$')
    PreambleOne,
    /// Expecting preamble character 2 ('X')
    PreambleTwo,
    /// Expecting direction character ('<', '>' or '!')
    Direction,
    /// Expecting the zero flag byte
    ZeroFlag,
    /// Expecting message id low byte
    IdLow,
    /// Expecting message id high byte
    IdHigh,
    /// Expecting payload length low byte
    LenLow,
    /// Expecting payload length high byte
    LenHigh,
    /// Expecting payload bytes
    Payload,
    /// Expecting the CRC byte
    Crc,
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    UnexpectedPreambleOne(u8),
    UnexpectedPreambleTwo(u8),
    UnexpectedDirection(u8),
    NonZeroFlag(u8),
    CrcMismatch { expected: u8, received: u8 },
    /// A framing-valid '!' reply; carries the message id it was answering.
    ErrorResponse(u16),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FrameError::UnexpectedPreambleOne(b) => {
                write!(f, "expected '$' for preamble byte 1, got 0x{:02x}", b)
            }
            FrameError::UnexpectedPreambleTwo(b) => {
                write!(f, "expected 'X' for preamble byte 2, got 0x{:02x}", b)
            }
            FrameError::UnexpectedDirection(b) => {
                write!(f, "expected '<', '>' or '!' for direction, got 0x{:02x}", b)
            }
            FrameError::NonZeroFlag(b) => write!(f, "expected 0 for zero flag, got 0x{:02x}", b),
            FrameError::CrcMismatch { expected, received } => write!(
                f,
                "CRC mismatch, expected 0x{:02x} but received 0x{:02x}",
                expected, received
            ),
            FrameError::ErrorResponse(id) => {
                write!(f, "received '!' error response for message id 0x{:04x}", id)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseStatus {
    NeedMore,
    Ready(Frame),
}

/// The per-link parser with its message scratchpad. One instance per
/// serial port; never shared.
pub struct FrameParser {
    state: ReadState,
    direction: u8,
    id_low: u8,
    id: u16,
    len_low: u8,
    len: u16,
    payload: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            state: ReadState::PreambleOne,
            direction: 0,
            id_low: 0,
            id: 0,
            len_low: 0,
            len: 0,
            payload: Vec::new(),
        }
    }

    /// Clear the scratchpad and return to hunting for a preamble.
    pub fn reset(&mut self) {
        self.state = ReadState::PreambleOne;
        self.direction = 0;
        self.id_low = 0;
        self.id = 0;
        self.len_low = 0;
        self.len = 0;
        self.payload = Vec::new();
    }

    /// True when the parser is between frames.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::PreambleOne
    }

    fn fail(&mut self, error: FrameError) -> Result<ParseStatus, FrameError> {
        self.reset();
        Err(error)
    }

    pub fn push_byte(&mut self, byte: u8) -> Result<ParseStatus, FrameError> {
        match self.state {
            ReadState::PreambleOne => {
                if byte != PREAMBLE_ONE {
                    return self.fail(FrameError::UnexpectedPreambleOne(byte));
                }
                self.state = ReadState::PreambleTwo;
            }
            ReadState::PreambleTwo => {
                if byte != PREAMBLE_TWO {
                    return self.fail(FrameError::UnexpectedPreambleTwo(byte));
                }
                self.state = ReadState::Direction;
            }
            ReadState::Direction => {
                if byte != DIRECTION_TO_FC && byte != DIRECTION_FROM_FC && byte != DIRECTION_ERROR {
                    return self.fail(FrameError::UnexpectedDirection(byte));
                }
                self.direction = byte;
                self.state = ReadState::ZeroFlag;
            }
            ReadState::ZeroFlag => {
                if byte != ZERO_FLAG {
                    return self.fail(FrameError::NonZeroFlag(byte));
                }
                self.state = ReadState::IdLow;
            }
            ReadState::IdLow => {
                self.id_low = byte;
                self.state = ReadState::IdHigh;
            }
            ReadState::IdHigh => {
                self.id = self.id_low as u16 | (byte as u16) << 8;
                self.state = ReadState::LenLow;
            }
            ReadState::LenLow => {
                self.len_low = byte;
                self.state = ReadState::LenHigh;
            }
            ReadState::LenHigh => {
                self.len = self.len_low as u16 | (byte as u16) << 8;
                if self.len > 0 {
                    self.payload = Vec::with_capacity(self.len as usize);
                    self.state = ReadState::Payload;
                } else {
                    self.state = ReadState::Crc;
                }
            }
            ReadState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.len as usize {
                    self.state = ReadState::Crc;
                }
            }
            ReadState::Crc => {
                let expected = message_crc(ZERO_FLAG, self.id, &self.payload);
                if byte != expected {
                    return self.fail(FrameError::CrcMismatch {
                        expected: expected,
                        received: byte,
                    });
                }

                if self.direction == DIRECTION_ERROR {
                    let id = self.id;
                    return self.fail(FrameError::ErrorResponse(id));
                }

                let frame = Frame {
                    direction: self.direction,
                    id: self.id,
                    payload: mem::replace(&mut self.payload, Vec::new()),
                };
                self.reset();

                return Ok(ParseStatus::Ready(frame));
            }
        }

        Ok(ParseStatus::NeedMore)
    }
}
