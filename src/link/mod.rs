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

//! Per-serial-port link state: the port lifecycle, the discovered flight
//! controller identity, and the snapshots the scheduler passes between
//! links.

pub mod session;
pub mod transport;

use std::fmt;
use std::time::Duration;

use msp::messages::{ApiVersion, CraftInfoAndPosition};

pub const NOT_SET: &'static str = "[Not Set]";
pub const NO_CRAFT_NAME: &'static str = "[No Craft Name]";

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum PortState {
    /// The port has not been opened yet
    Closed,
    /// The port failed to open
    OpenFailed,
    /// The port is open but the session is not initialized
    Opened,
    /// Identity is discovered and regular session operations are running
    Running,
}

impl PortState {
    pub fn is_closed_or_failed(&self) -> bool {
        *self == PortState::Closed || *self == PortState::OpenFailed
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            PortState::Closed => "PortClosed",
            PortState::OpenFailed => "PortOpenFailed",
            PortState::Opened => "PortOpened",
            PortState::Running => "SessionRunning",
        };

        write!(f, "{}", name)
    }
}

/// What a flight controller told us about itself during discovery.
/// Immutable once a session is running; cleared on a port reset.
#[derive(Debug, Clone, PartialEq)]
pub struct FcIdentity {
    /// "INAV", "BTFL", etc.
    pub variant: Option<String>,
    pub uid: Option<[u32; 3]>,
    pub api_version: Option<ApiVersion>,
    /// e.g. "Bob's Quad"
    pub craft_name: Option<String>,
    /// Whether the controller wants to be told about other craft positions.
    pub other_craft_setting: Option<bool>,
}

impl FcIdentity {
    pub fn new() -> FcIdentity {
        FcIdentity {
            variant: None,
            uid: None,
            api_version: None,
            craft_name: None,
            other_craft_setting: None,
        }
    }

    pub fn reset(&mut self) {
        *self = FcIdentity::new();
    }

    /// Discovery is complete when variant, uid, api version and craft name
    /// are known — and, on an API that carries the other-craft messages,
    /// the position setting has been heard as well.
    pub fn all_required_discovered(&self) -> bool {
        let setting_discovered_if_needed = match self.api_version {
            Some(ref api) => {
                if api.has_other_craft_messages() {
                    self.other_craft_setting.is_some()
                } else {
                    true
                }
            }
            None => false,
        };

        self.variant.is_some() && self.uid.is_some() && self.api_version.is_some()
            && self.craft_name.is_some() && setting_discovered_if_needed
    }

    pub fn wants_other_craft_updates(&self) -> bool {
        self.other_craft_setting == Some(true)
    }

    pub fn craft_name_or_placeholder(&self) -> &str {
        match self.craft_name {
            Some(ref name) => name,
            None => NO_CRAFT_NAME,
        }
    }

    pub fn uid_hex(&self) -> String {
        match self.uid {
            Some(uid) => format!("0x{:08x}{:08x}{:08x}", uid[0], uid[1], uid[2]),
            None => NOT_SET.to_string(),
        }
    }

    pub fn api_version_string(&self) -> String {
        match self.api_version {
            Some(ref api) => format!("{}", api),
            None => NOT_SET.to_string(),
        }
    }
}

/// What one link knows about another link's craft at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerPosition {
    /// The peer has not produced a GPS fix since its session started.
    NotYetReceived,
    /// Last fix is older than the stale interval; age in milliseconds.
    Stale(i64),
    /// A forwardable fix, with its age in milliseconds.
    Fresh(CraftInfoAndPosition, i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub craft_name: String,
    pub position: PeerPosition,
}

pub fn duration_to_ms(duration: Duration) -> i64 {
    duration.as_secs() as i64 * 1000 + (duration.subsec_nanos() / 1_000_000) as i64
}
