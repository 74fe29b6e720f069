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

//! The byte-stream duplex seam between a link session and its device.
//!
//! The real implementation wraps a serial port; tests substitute an
//! in-memory wire.

use std::fs;
use std::io;
use std::io::{Read, Write};
use std::time::Duration;

use serial;
use serial::SerialPort;

pub trait Transport {
    /// Open the device and apply 8-N-1 framing at the given baud rate.
    fn open(&mut self, baud: u32) -> io::Result<()>;

    /// Close the device, cancelling anything outstanding. The OS handle is
    /// released.
    fn close(&mut self);

    /// Non-blocking single-byte read. `Ok(None)` means no byte is waiting.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Discard whatever input the OS buffered while we were not looking.
    fn flush_input(&mut self);

    /// Drop and recreate internal state for a hard reset.
    fn rebuild(&mut self);
}

fn serial_to_io_error(error: serial::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}", error))
}

fn not_open_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port is not open")
}

pub struct SerialTransport {
    path: String,
    port: Option<serial::SystemPort>,
}

impl SerialTransport {
    pub fn new(path: &str) -> SerialTransport {
        SerialTransport {
            path: path.to_string(),
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, baud: u32) -> io::Result<()> {
        let mut port = serial::open(&self.path).map_err(serial_to_io_error)?;

        port.reconfigure(&|settings| {
            try!(settings.set_baud_rate(serial::BaudRate::from_speed(baud as usize)));
            settings.set_char_size(serial::Bits8);
            settings.set_parity(serial::ParityNone);
            settings.set_stop_bits(serial::Stop1);
            settings.set_flow_control(serial::FlowNone);
            Ok(())
        }).map_err(serial_to_io_error)?;

        // zero timeout turns reads non-blocking; the relay loop polls
        port.set_timeout(Duration::from_secs(0))
            .map_err(serial_to_io_error)?;

        self.port = Some(port);

        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let port = match self.port {
            Some(ref mut port) => port,
            None => return Err(not_open_error()),
        };

        let mut buf = [0_u8; 1];
        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = match self.port {
            Some(ref mut port) => port,
            None => return Err(not_open_error()),
        };

        port.write_all(bytes)?;
        port.flush()
    }

    fn flush_input(&mut self) {
        // the serial crate has no purge call; drain instead, bounded so a
        // chattering device cannot wedge the loop
        for _ in 0..4096 {
            match self.read_byte() {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }

    fn rebuild(&mut self) {
        self.port = None;
    }
}

/// Serial device names worth probing when `--ports auto` is in effect.
const AUTO_DEVICE_PREFIXES: [&'static str; 3] = ["ttyUSB", "ttyACM", "ttyAMA"];

pub fn enumerate_ports() -> Vec<String> {
    let mut names = Vec::new();

    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };

            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            for prefix in &AUTO_DEVICE_PREFIXES {
                if name.starts_with(prefix) {
                    names.push(format!("/dev/{}", name));
                    break;
                }
            }
        }
    }

    names.sort();
    names
}

#[cfg(test)]
pub struct MockWire {
    /// Bytes the fake controller has written toward the relay.
    pub inbound: ::std::collections::VecDeque<u8>,
    /// Bytes the relay has written toward the fake controller.
    pub outbound: Vec<u8>,
    pub fail_open: bool,
    pub fail_read: bool,
    pub open_count: u32,
}

#[cfg(test)]
pub struct MockTransport {
    wire: ::std::rc::Rc<::std::cell::RefCell<MockWire>>,
    open: bool,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> (MockTransport, ::std::rc::Rc<::std::cell::RefCell<MockWire>>) {
        let wire = ::std::rc::Rc::new(::std::cell::RefCell::new(MockWire {
            inbound: ::std::collections::VecDeque::new(),
            outbound: Vec::new(),
            fail_open: false,
            fail_read: false,
            open_count: 0,
        }));

        let transport = MockTransport {
            wire: wire.clone(),
            open: false,
        };

        (transport, wire)
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn open(&mut self, _baud: u32) -> io::Result<()> {
        let mut wire = self.wire.borrow_mut();
        wire.open_count += 1;
        if wire.fail_open {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }

        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if !self.open {
            return Err(not_open_error());
        }

        let mut wire = self.wire.borrow_mut();
        if wire.fail_read {
            wire.fail_read = false;
            return Err(io::Error::new(io::ErrorKind::Other, "injected read error"));
        }

        Ok(wire.inbound.pop_front())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.open {
            return Err(not_open_error());
        }

        self.wire.borrow_mut().outbound.extend_from_slice(bytes);
        Ok(())
    }

    fn flush_input(&mut self) {
        // the mock wire has no line garbage to discard, and draining here
        // would eat bytes tests queued ahead of the open
    }

    fn rebuild(&mut self) {
        self.open = false;
    }
}
