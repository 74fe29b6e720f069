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

//! A single communications session with an MSP-speaking flight controller
//! (iNav, Betaflight, etc.) on one serial port.
//!
//! The scheduler drives each session with `pump` (drain inbound bytes)
//! and `poll` (advance the state machine once). All errors are contained
//! here; nothing propagates to the scheduler.

use std::thread;
use std::time::{Duration, Instant};

use config::Config;
use geo;
use link::transport::Transport;
use link::{duration_to_ms, FcIdentity, PeerPosition, PeerSnapshot, PortState};
use msp;
use msp::messages::{self, ApiVersion, CraftInfoAndPosition, CraftName, FcVariant, MessageError,
                    OtherCraftPositionSetting, RawGps, Uid};
use msp::parser::{FrameError, FrameParser, ParseStatus};
use msp::Frame;
use phantom::PhantomCraft;
use relay::shutdown::ShutdownFlag;

/// How long a link may go without a GPS fix before the watchdog restarts it.
pub const WATCHDOG_TIMEOUT_MS: i64 = 15_000;

/// Settle time between a hard reset and the next reopen attempt.
const READ_ERROR_COOLDOWN_MS: u64 = 1_000;

pub struct LinkSession {
    port_name: String,
    baud: u32,
    state: PortState,
    transport: Box<Transport>,
    parser: FrameParser,
    identity: FcIdentity,

    /// Last known position. When connectivity goes wrong this is stale
    /// data, but let's focus on the positive.
    current_position: RawGps,
    position_ever_received: bool,
    position_received_at: Option<Instant>,

    /// When we first tried to open the port (per session; cleared on reset).
    initial_open_at: Option<Instant>,

    sequential_read_errors: u32,
    sequential_write_errors: u32,

    stale_interval_ms: u32,
    exit_on_gps_loss: bool,
    omit_gps_pos: bool,
    shutdown: ShutdownFlag,
}

impl LinkSession {
    pub fn new(
        port_name: &str,
        transport: Box<Transport>,
        config: &Config,
        shutdown: ShutdownFlag,
    ) -> LinkSession {
        LinkSession {
            port_name: port_name.to_string(),
            baud: config.baud,
            state: PortState::Closed,
            transport: transport,
            parser: FrameParser::new(),
            identity: FcIdentity::new(),
            current_position: RawGps::zeroed(),
            position_ever_received: false,
            position_received_at: None,
            initial_open_at: None,
            sequential_read_errors: 0,
            sequential_write_errors: 0,
            stale_interval_ms: config.stale_interval_ms,
            exit_on_gps_loss: config.exit_on_gps_loss,
            omit_gps_pos: config.omit_gps_pos,
            shutdown: shutdown,
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn identity(&self) -> &FcIdentity {
        &self.identity
    }

    /// "com4" or "com4 (Bob's Quad)" once the craft name is known.
    fn log_prefix(&self) -> String {
        match self.identity.craft_name {
            Some(ref name) => format!("{} ({})", self.port_name, name),
            None => self.port_name.clone(),
        }
    }

    // ---- inbound path -----------------------------------------------------

    /// Drain every byte the device has ready. Called by the scheduler on
    /// each tick so inbound data is never starved between polls.
    pub fn pump(&mut self, now: Instant) {
        if self.shutdown.requested() {
            return;
        }

        loop {
            match self.transport.read_byte() {
                Ok(Some(byte)) => {
                    self.sequential_read_errors = 0;
                    self.on_byte(byte, now);
                }
                Ok(None) => break,
                Err(e) => {
                    self.sequential_read_errors += 1;

                    // read errors are expected while the port is down
                    if self.state.is_closed_or_failed() {
                        trace!(target: &self.port_name,
                               "{}: read error while port closed: {}", self.log_prefix(), e);
                    } else {
                        error!(target: &self.port_name,
                               "{}: had problem reading byte from port: {}", self.log_prefix(), e);
                        error!(target: &self.port_name,
                               "{}: doing hard reset on port", self.log_prefix());
                        self.reset_port_hard();
                        // let the device settle before the reopen attempt
                        thread::sleep(Duration::from_millis(READ_ERROR_COOLDOWN_MS));
                    }

                    break;
                }
            }
        }
    }

    /// Feed one inbound byte through the parser.
    fn on_byte(&mut self, byte: u8, now: Instant) {
        match self.parser.push_byte(byte) {
            Ok(ParseStatus::NeedMore) => {}
            Ok(ParseStatus::Ready(frame)) => self.handle_frame(frame, now),
            Err(FrameError::ErrorResponse(id)) => {
                error!(target: &self.port_name,
                       "{}: received '!' error response for message id 0x{:04x}, discarding",
                       self.log_prefix(), id);
            }
            Err(e) => {
                error!(target: &self.port_name,
                       "{}: had problem parsing message byte: {}", self.log_prefix(), e);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        match frame.id {
            msp::MSP_FC_VARIANT => match FcVariant::decode(&frame.payload) {
                Ok(variant) => {
                    debug!(target: &self.port_name,
                           "{}: successfully parsed FcVariant message: {}",
                           self.log_prefix(), variant.identifier);
                    self.identity.variant = Some(variant.identifier);
                }
                Err(e) => self.log_message_error(e),
            },

            msp::MSP_UID => match Uid::decode(&frame.payload) {
                Ok(uid) => {
                    self.identity.uid = Some(uid.uid);
                    debug!(target: &self.port_name,
                           "{}: successfully parsed UID message: {}",
                           self.log_prefix(), self.identity.uid_hex());
                }
                Err(e) => self.log_message_error(e),
            },

            msp::MSP_API_VERSION => match ApiVersion::decode(&frame.payload) {
                Ok(api) => {
                    if api.protocol != messages::EXPECTED_MSP_PROTOCOL_VERSION {
                        warn!(target: &self.port_name,
                              "{}: unexpected MSP protocol version {} (expected {})",
                              self.log_prefix(), api.protocol,
                              messages::EXPECTED_MSP_PROTOCOL_VERSION);
                    }
                    self.identity.api_version = Some(api);
                    debug!(target: &self.port_name,
                           "{}: successfully parsed MSP API message: {}",
                           self.log_prefix(), self.identity.api_version_string());
                }
                Err(e) => self.log_message_error(e),
            },

            msp::MSP_NAME => {
                // grab the prefix before updating, so the line reflects the
                // name understanding from before this message worked
                let prefix = self.log_prefix();
                match CraftName::decode(&frame.payload) {
                    Ok(craft_name) => {
                        debug!(target: &self.port_name,
                               "{}: successfully parsed craft name: {}", prefix, craft_name.name);
                        self.identity.craft_name = Some(craft_name.name);
                    }
                    Err(e) => self.log_message_error(e),
                }
            }

            msp::MSP_RAW_GPS => match RawGps::decode(&frame.payload) {
                Ok(gps) => {
                    self.current_position = gps;
                    self.position_ever_received = true;
                    self.position_received_at = Some(now);

                    info!(target: &self.port_name,
                          "{}: got new GPS position: {} - Alt {} meters - Course {} - Speed {} - {} (HDOP {}, {} sat)",
                          self.log_prefix(),
                          geo::lat_lon_string(self.omit_gps_pos, gps.msp_lat, gps.msp_lon),
                          gps.altitude_m as i16,
                          geo::decidegree_string(gps.course_decideg as i16),
                          gps.speed,
                          geo::fix_type_string(gps.fix_type),
                          geo::hdop_string(gps.hdop),
                          gps.num_sat);
                }
                Err(e) => self.log_message_error(e),
            },

            msp::MSP2_INAV_OTHER_CRAFT_POSITION_SETTING => {
                match OtherCraftPositionSetting::decode(&frame.payload) {
                    Ok(setting) => {
                        self.identity.other_craft_setting = Some(setting.should_send_updates);
                        info!(target: &self.port_name,
                              "{}: received reply about OtherCraftPositionSetting. Wants updates: {}",
                              self.log_prefix(), setting.should_send_updates);
                    }
                    Err(e) => self.log_message_error(e),
                }
            }

            msp::MSP2_INAV_OTHER_CRAFT_POSITION => {
                // the controller acknowledges a forwarded position with an
                // empty payload
                if frame.payload.is_empty() {
                    debug!(target: &self.port_name,
                           "{}: received OtherCraftPosition ACK-type response", self.log_prefix());
                } else {
                    error!(target: &self.port_name,
                           "{}: data payload for OtherCraftPosition unexpectedly non-empty ({} bytes), so not an ACK",
                           self.log_prefix(), frame.payload.len());
                }
            }

            id => {
                error!(target: &self.port_name,
                       "{}: unknown message id: {}", self.log_prefix(), id);
            }
        }
    }

    fn log_message_error(&self, error: MessageError) {
        error!(target: &self.port_name, "{}: {}", self.log_prefix(), error);
    }

    // ---- outbound path ----------------------------------------------------

    fn send_frame(&mut self, id: u16, payload: &[u8]) {
        let bytes = messages::build_frame(id, payload);
        trace!(target: &self.port_name,
               "{}: built MSP message packet - id 0x{:04x} - {} bytes long, expected transmit time {} ms",
               self.log_prefix(), id, bytes.len(),
               self.expected_transmit_time_ms(bytes.len()));

        match self.transport.write_all(&bytes) {
            Ok(()) => {
                self.sequential_write_errors = 0;
            }
            Err(e) => {
                self.sequential_write_errors += 1;
                if !self.state.is_closed_or_failed() {
                    error!(target: &self.port_name,
                           "{}: write error: {}", self.log_prefix(), e);
                }
            }
        }
    }

    /// Assumes one start and one stop bit per byte on the wire.
    fn expected_transmit_time_ms(&self, byte_count: usize) -> u64 {
        (byte_count as u64 * 10 * 1000) / self.baud as u64
    }

    fn request_message(&mut self, name: &str, id: u16) {
        debug!(target: &self.port_name, "{}: requesting {}", self.log_prefix(), name);
        self.send_frame(id, &[]);
    }

    fn send_other_craft_position_setting(&mut self, this_side_wants_updates: bool) {
        trace!(target: &self.port_name,
               "{}: sending OtherCraftPositionSetting query", self.log_prefix());

        // the ground side never wants position updates itself; sending the
        // setting is just a way to prompt the controller into answering
        // with its own
        let setting = OtherCraftPositionSetting {
            should_send_updates: this_side_wants_updates,
        };
        let payload = setting.encode_payload();
        self.send_frame(msp::MSP2_INAV_OTHER_CRAFT_POSITION_SETTING, &payload);
    }

    // ---- state machine ----------------------------------------------------

    /// Advance this link once. Called by the scheduler in round-robin
    /// order, one link per timer fire.
    pub fn poll(
        &mut self,
        now: Instant,
        peers: &[PeerSnapshot],
        self_index: usize,
        phantoms: &mut [PhantomCraft],
    ) {
        if self.shutdown.requested() {
            return;
        }

        trace!(target: &self.port_name,
               "{}: refreshing link state - {}", self.log_prefix(), self.state);

        if self.restart_port_if_necessary(now) {
            // soft reset just happened; reopen on the next tick
            return;
        }
        if self.shutdown.requested() {
            return;
        }

        match self.state {
            // aggressively retry ports that are not open
            PortState::Closed | PortState::OpenFailed => self.open_port(now),

            PortState::Opened => {
                // baseline controller information is a requirement for
                // proper operation, so retry indefinitely until complete
                if self.identity.all_required_discovered() {
                    info!(target: &self.port_name,
                          "{}: identity discovery complete ({} - UID {}), starting session",
                          self.log_prefix(),
                          self.identity.api_version_string(),
                          self.identity.uid_hex());
                    self.state = PortState::Running;
                } else {
                    self.request_missing_identity();
                }
            }

            PortState::Running => self.session_running_operations(now, peers, self_index, phantoms),
        }
    }

    fn open_port(&mut self, now: Instant) {
        trace!(target: &self.port_name, "{}: opening port", self.log_prefix());

        if self.initial_open_at.is_none() {
            self.initial_open_at = Some(now);
        }

        match self.transport.open(self.baud) {
            Ok(()) => {
                // clear line garbage from before this session
                self.transport.flush_input();
                self.parser.reset();
                self.state = PortState::Opened;
                info!(target: &self.port_name,
                      "Connected to: {} at {} baud - {}", self.port_name, self.baud, self.state);
            }
            Err(e) => {
                error!(target: &self.port_name,
                       "{}: could not connect: {}", self.port_name, e);
                self.state = PortState::OpenFailed;
            }
        }
    }

    /// Ask only for the identity pieces we do not have yet.
    fn request_missing_identity(&mut self) {
        trace!(target: &self.port_name,
               "{}: requesting initial flight controller information", self.log_prefix());

        if self.identity.variant.is_none() {
            self.request_message("FcVariant", msp::MSP_FC_VARIANT);
        }
        if self.identity.uid.is_none() {
            self.request_message("UID", msp::MSP_UID);
        }
        if self.identity.api_version.is_none() {
            self.request_message("ApiVersion", msp::MSP_API_VERSION);
        }
        if self.identity.craft_name.is_none() {
            self.request_message("CraftName", msp::MSP_NAME);
        }

        // only chase the position setting once we know the API carries it
        if self.identity.other_craft_setting.is_none() {
            if let Some(api) = self.identity.api_version {
                if api.has_other_craft_messages() {
                    info!(target: &self.port_name,
                          "{}: MSP API {} supports other-craft messages. Requesting position setting...",
                          self.log_prefix(), self.identity.api_version_string());
                    self.send_other_craft_position_setting(false);
                } else {
                    info!(target: &self.port_name,
                          "{}: MSP API {} does not support other-craft messages.",
                          self.log_prefix(), self.identity.api_version_string());
                }
            }
        }
    }

    /// Regular operations once a session is up: forward peers, forward
    /// phantoms, then ask for our own position. The order is fixed.
    fn session_running_operations(
        &mut self,
        now: Instant,
        peers: &[PeerSnapshot],
        self_index: usize,
        phantoms: &mut [PhantomCraft],
    ) {
        trace!(target: &self.port_name,
               "{}: session running operations - {}", self.log_prefix(), self.state);

        self.send_notices_about_other_crafts(peers, self_index);
        self.send_notices_about_phantom_crafts(now, phantoms);
        self.request_message("RawGPS position", msp::MSP_RAW_GPS);
    }

    fn send_notices_about_other_crafts(&mut self, peers: &[PeerSnapshot], self_index: usize) {
        if !self.identity.wants_other_craft_updates() {
            return;
        }

        trace!(target: &self.port_name,
               "{}: sending notices about other crafts", self.log_prefix());

        for (index, peer) in peers.iter().enumerate() {
            // only tell this controller about OTHER craft
            if index == self_index {
                continue;
            }

            match peer.position {
                PeerPosition::NotYetReceived => {
                    warn!(target: &self.port_name,
                          "{}: other craft {} - GPS position not yet received, skipping",
                          self.log_prefix(), peer.craft_name);
                }
                PeerPosition::Stale(age_ms) => {
                    warn!(target: &self.port_name,
                          "{}: other craft {} has stale position, is {} ms old. Not sending.",
                          self.log_prefix(), peer.craft_name, age_ms);
                }
                PeerPosition::Fresh(ref info, age_ms) => {
                    debug!(target: &self.port_name,
                           "{}: other craft {} position sufficiently fresh, is {} ms old. Sending...",
                           self.log_prefix(), peer.craft_name, age_ms);
                    let payload = info.encode_payload();
                    self.send_frame(msp::MSP2_INAV_OTHER_CRAFT_POSITION, &payload);
                }
            }
        }
    }

    fn send_notices_about_phantom_crafts(&mut self, now: Instant, phantoms: &mut [PhantomCraft]) {
        if !self.identity.wants_other_craft_updates() || phantoms.is_empty() {
            return;
        }

        trace!(target: &self.port_name,
               "{}: sending notices about phantom crafts", self.log_prefix());

        // phantoms that track a reference track the craft on this port
        let reference = self.craft_info();
        let (reference_is_stale, _) = self.position_is_stale(now);

        for phantom in phantoms.iter_mut() {
            phantom.update_reference(&reference, reference_is_stale);

            match phantom.eligibility(&self.port_name) {
                Ok(()) => {
                    if let Some(position) = phantom.current_position() {
                        info!(target: &self.port_name,
                              "{}: sending phantom craft: {} - Alt {} meters",
                              self.log_prefix(),
                              position.location_string(self.omit_gps_pos),
                              position.altitude_m as i16);
                        let payload = position.encode_payload();
                        self.send_frame(msp::MSP2_INAV_OTHER_CRAFT_POSITION, &payload);
                    }
                }
                Err(reason) => {
                    warn!(target: &self.port_name,
                          "{}: skipping phantom craft {}, not eligible: {}",
                          self.log_prefix(), phantom.craft_name(), reason);
                }
            }
        }
    }

    // ---- watchdog and resets ----------------------------------------------

    /// Restart the port when GPS has gone quiet too long. Returns true when
    /// a reset happened (or shutdown was initiated) this poll.
    fn restart_port_if_necessary(&mut self, now: Instant) -> bool {
        // timeout applies whether GPS was heard at least once or never at all
        let comparison = if self.position_ever_received {
            self.position_received_at
        } else {
            self.initial_open_at
        };

        let comparison = match comparison {
            Some(t) => t,
            None => {
                trace!(target: &self.port_name,
                       "{}: too early to check for port restart timeout", self.log_prefix());
                return false;
            }
        };

        let elapsed_ms = duration_to_ms(now.duration_since(comparison));
        if elapsed_ms <= WATCHDOG_TIMEOUT_MS {
            return false;
        }

        error!(target: &self.port_name,
               "{}: has not heard GPS position response in {} ms ({} sec).",
               self.log_prefix(), elapsed_ms, elapsed_ms / 1000);

        if self.exit_on_gps_loss {
            error!(target: &self.port_name,
                   "{}: failed to get GPS location. Exiting.", self.log_prefix());
            self.shutdown.request();
            return true;
        }

        error!(target: &self.port_name, "{}: restarting port.", self.log_prefix());
        self.reset_port_soft();
        true
    }

    /// Close the port and forget everything session-scoped. The next poll
    /// starts over from `Closed`.
    fn reset_port_soft(&mut self) {
        self.transport.flush_input();
        self.transport.close();
        self.parser.reset();
        self.identity.reset();
        self.state = PortState::Closed;
        self.current_position = RawGps::zeroed();
        self.position_ever_received = false;
        self.position_received_at = None;
        self.initial_open_at = None;
    }

    /// A soft reset plus a rebuild of the transport internals.
    fn reset_port_hard(&mut self) {
        self.reset_port_soft();
        self.transport.rebuild();
    }

    // ---- snapshots ---------------------------------------------------------

    /// Age of the stored fix and whether the stale rule suppresses it.
    /// A zero stale interval disables the check entirely.
    fn position_is_stale(&self, now: Instant) -> (bool, i64) {
        let age_ms = match self.position_received_at {
            Some(t) => duration_to_ms(now.duration_since(t)),
            None => i64::max_value(),
        };

        let never_times_out = self.stale_interval_ms == 0;
        (age_ms >= self.stale_interval_ms as i64 && !never_times_out, age_ms)
    }

    /// The craft this session is connected to, as forwarded to peers.
    pub fn craft_info(&self) -> CraftInfoAndPosition {
        CraftInfoAndPosition {
            uid: self.identity.uid.unwrap_or([0; 3]),
            fix_type: self.current_position.fix_type,
            num_sat: self.current_position.num_sat,
            msp_lat: self.current_position.msp_lat,
            msp_lon: self.current_position.msp_lon,
            altitude_m: self.current_position.altitude_m,
            speed: self.current_position.speed,
            course_decideg: self.current_position.course_decideg,
            craft_name: self.identity.craft_name.clone().unwrap_or_else(String::new),
        }
    }

    /// The last known position, if this session is running and the fix is
    /// within the stale interval.
    pub fn fresh_snapshot(&self, now: Instant) -> Option<CraftInfoAndPosition> {
        if self.state != PortState::Running || !self.position_ever_received {
            return None;
        }

        let (stale, _) = self.position_is_stale(now);
        if stale {
            None
        } else {
            Some(self.craft_info())
        }
    }

    /// What the scheduler shows the other links about this one.
    pub fn peer_snapshot(&self, now: Instant) -> PeerSnapshot {
        let (_, age_ms) = self.position_is_stale(now);

        let position = match self.fresh_snapshot(now) {
            Some(info) => PeerPosition::Fresh(info, age_ms),
            None => {
                if self.state == PortState::Running && self.position_ever_received {
                    PeerPosition::Stale(age_ms)
                } else {
                    PeerPosition::NotYetReceived
                }
            }
        };

        PeerSnapshot {
            craft_name: self.identity.craft_name_or_placeholder().to_string(),
            position: position,
        }
    }

    /// Final close at process shutdown.
    pub fn shutdown(&mut self) {
        info!(target: &self.port_name, "{}: shutting down.", self.log_prefix());
        self.transport.close();
    }
}
