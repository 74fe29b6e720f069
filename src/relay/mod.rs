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

//! The relay scheduler: a single-threaded cooperative loop that services
//! every link in round-robin order.
//!
//! Each timer fire drains inbound bytes on every link and then polls
//! exactly one link's state machine. Links never see each other directly;
//! the scheduler snapshots every link's last known position and hands the
//! snapshots into the polled link.

pub mod shutdown;

use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

use link::session::LinkSession;
use link::PeerSnapshot;
use phantom::PhantomCraft;
use self::shutdown::ShutdownFlag;

struct CleanupLatch {
    in_progress: bool,
    completed: bool,
}

pub struct Relay {
    links: Vec<LinkSession>,
    phantoms: Vec<PhantomCraft>,
    interval: Duration,
    next_index: usize,
    shutdown: ShutdownFlag,
    cleanup: Mutex<CleanupLatch>,
    started_at: Instant,
}

impl Relay {
    pub fn new(
        links: Vec<LinkSession>,
        phantoms: Vec<PhantomCraft>,
        refresh_interval_ms: u32,
        shutdown: ShutdownFlag,
    ) -> Relay {
        Relay {
            links: links,
            phantoms: phantoms,
            interval: Duration::from_millis(refresh_interval_ms as u64),
            next_index: 0,
            shutdown: shutdown,
            cleanup: Mutex::new(CleanupLatch {
                in_progress: false,
                completed: false,
            }),
            started_at: Instant::now(),
        }
    }

    /// One timer fire: drain every link's inbound bytes, then advance one
    /// link's state machine. The round-robin index moves by exactly one.
    pub fn tick(&mut self, now: Instant) {
        if self.shutdown.requested() {
            debug!("tick skipped, shutdown in progress");
            return;
        }

        for link in self.links.iter_mut() {
            link.pump(now);
        }

        if self.links.is_empty() {
            trace!("no flight controller links to refresh");
            return;
        }

        let snapshots: Vec<PeerSnapshot> =
            self.links.iter().map(|link| link.peer_snapshot(now)).collect();

        let index = self.next_index;
        self.links[index].poll(now, &snapshots, index, &mut self.phantoms);

        self.next_index += 1;
        if self.next_index >= self.links.len() {
            // wrap back to the first link
            self.next_index = 0;
        }
    }

    /// Run until shutdown is requested, firing a tick every refresh
    /// interval. The timer re-arms at previous-fire + interval so ticks do
    /// not drift with servicing time.
    pub fn run(&mut self) {
        let interval_ms = self.interval.as_secs() * 1000 + (self.interval.subsec_nanos() / 1_000_000) as u64;
        trace!("relay loop running at {} ms refresh interval", interval_ms);

        let mut next_fire = Instant::now() + self.interval;

        loop {
            if self.shutdown.requested() {
                debug!("relay loop exiting, shutdown requested");
                break;
            }

            let now = Instant::now();
            if now < next_fire {
                sleep(next_fire - now);
            }

            if self.shutdown.requested() {
                break;
            }

            self.tick(Instant::now());

            next_fire += self.interval;
            let after = Instant::now();
            if next_fire < after {
                warn!("relay loop unable to keep up with the {} ms refresh interval", interval_ms);
                next_fire = after;
            }
        }

        self.cleanup_and_shutdown();
    }

    /// Close every port and stop. Latched so a second entry is a no-op.
    pub fn cleanup_and_shutdown(&mut self) {
        {
            let mut latch = self.cleanup.lock().unwrap();
            if latch.in_progress || latch.completed {
                return;
            }
            latch.in_progress = true;
        }

        let elapsed = self.started_at.elapsed();
        info!(
            "CraftServices elapsed run time: {} seconds ({} minutes)",
            elapsed.as_secs(),
            elapsed.as_secs() / 60
        );

        for link in self.links.iter_mut() {
            link.shutdown();
        }

        info!("Exiting...");

        let mut latch = self.cleanup.lock().unwrap();
        latch.in_progress = false;
        latch.completed = true;
    }

    #[cfg(test)]
    fn link(&self, index: usize) -> &LinkSession {
        &self.links[index]
    }

    #[cfg(test)]
    fn next_index(&self) -> usize {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use env_logger;

    use config::tests::test_config;
    use config::Config;
    use geo;
    use geo::GeoPoint;
    use link::transport::{MockTransport, MockWire};
    use link::PortState;
    use msp;
    use msp::codec::serialize_u32;
    use msp::messages::{build_frame_with_direction, CraftInfoAndPosition, RawGps};
    use msp::parser::{FrameParser, ParseStatus};
    use msp::Frame;
    use phantom::{PhantomCraft, WingmanCraft};

    type Wire = Rc<RefCell<MockWire>>;

    fn reply(wire: &Wire, id: u16, payload: &[u8]) {
        let bytes = build_frame_with_direction(msp::DIRECTION_FROM_FC, id, payload);
        wire.borrow_mut().inbound.extend(bytes);
    }

    fn push_identity(wire: &Wire, uid: [u32; 3], name: &str, wants_updates: bool) {
        reply(wire, msp::MSP_API_VERSION, &[0, 2, 3]);
        reply(wire, msp::MSP_FC_VARIANT, b"INAV");

        let mut uid_payload = Vec::new();
        for word in &uid {
            serialize_u32(*word, &mut uid_payload);
        }
        reply(wire, msp::MSP_UID, &uid_payload);
        reply(wire, msp::MSP_NAME, name.as_bytes());
        reply(
            wire,
            msp::MSP2_INAV_OTHER_CRAFT_POSITION_SETTING,
            &[wants_updates as u8],
        );
    }

    fn push_raw_gps(wire: &Wire, gps: &RawGps) {
        reply(wire, msp::MSP_RAW_GPS, &gps.encode_payload());
    }

    fn outbound_frames(wire: &Wire) -> Vec<Frame> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in &wire.borrow().outbound {
            if let Ok(ParseStatus::Ready(frame)) = parser.push_byte(*byte) {
                frames.push(frame);
            }
        }
        frames
    }

    fn position_frames(wire: &Wire) -> Vec<CraftInfoAndPosition> {
        outbound_frames(wire)
            .iter()
            .filter(|frame| frame.id == msp::MSP2_INAV_OTHER_CRAFT_POSITION)
            .map(|frame| CraftInfoAndPosition::decode(&frame.payload).unwrap())
            .collect()
    }

    fn make_relay(
        ports: &[&str],
        phantoms: Vec<PhantomCraft>,
        config: &Config,
    ) -> (Relay, Vec<Wire>, ShutdownFlag) {
        let shutdown = ShutdownFlag::new();
        let mut links = Vec::new();
        let mut wires = Vec::new();

        for port in ports {
            let (transport, wire) = MockTransport::new();
            links.push(LinkSession::new(
                port,
                Box::new(transport),
                config,
                shutdown.clone(),
            ));
            wires.push(wire);
        }

        let relay = Relay::new(links, phantoms, config.refresh_interval_ms, shutdown.clone());
        (relay, wires, shutdown)
    }

    /// Tick until every link has opened, absorbed the preloaded identity
    /// replies and reached `SessionRunning`. Returns the clock after the
    /// last tick.
    fn run_to_running(relay: &mut Relay, t0: Instant, step: Duration, links: usize) -> Instant {
        let mut now = t0;
        for _ in 0..(links * 3) {
            relay.tick(now);
            now += step;
        }

        for index in 0..links {
            assert_eq!(relay.link(index).state(), PortState::Running);
        }

        now
    }

    fn sample_gps() -> RawGps {
        RawGps {
            fix_type: msp::GPS_FIX_3D,
            num_sat: 12,
            msp_lat: 394907560,
            msp_lon: (-1050815770_i32) as u32,
            altitude_m: 5,
            speed: 0,
            course_decideg: 4500,
            hdop: 110,
        }
    }

    #[test]
    fn test_happy_round_trip_forwards_position() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) = make_relay(&["com20", "com21"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        push_identity(&wires[1], [40, 50, 60], "BravoQuad", true);

        let mut now = run_to_running(&mut relay, t0, step, 2);

        // controller A reports a fix
        push_raw_gps(&wires[0], &sample_gps());
        wires[1].borrow_mut().outbound.clear();

        // next two ticks pump A's fix and poll B, which forwards it
        for _ in 0..2 {
            relay.tick(now);
            now += step;
        }

        let forwarded = position_frames(&wires[1]);
        assert_eq!(forwarded.len(), 1);

        let info = &forwarded[0];
        assert_eq!(info.uid, [10, 20, 30]);
        assert_eq!(info.fix_type, msp::GPS_FIX_3D);
        assert_eq!(info.num_sat, 12);
        assert_eq!(info.msp_lat, 394907560);
        assert_eq!(info.msp_lon, (-1050815770_i32) as u32);
        assert_eq!(info.altitude_m, 5);
        assert_eq!(info.speed, 0);
        assert_eq!(info.course_decideg, 4500);
        assert_eq!(info.craft_name, "AlphaQuad");

        // nothing reflected back to A about itself
        assert_eq!(position_frames(&wires[0]).len(), 0);
    }

    #[test]
    fn test_stale_position_is_not_forwarded() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) = make_relay(&["com20", "com21"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        push_identity(&wires[1], [40, 50, 60], "BravoQuad", true);

        let mut now = run_to_running(&mut relay, t0, step, 2);

        push_raw_gps(&wires[0], &sample_gps());
        // the fix is pumped and forwarded once while fresh
        for _ in 0..2 {
            relay.tick(now);
            now += step;
        }
        let forwarded_while_fresh = position_frames(&wires[1]).len();
        assert!(forwarded_while_fresh > 0);

        // advance past the 4000 ms stale interval with no new fix
        now += Duration::from_millis(4001);
        wires[1].borrow_mut().outbound.clear();
        for _ in 0..4 {
            relay.tick(now);
            now += step;
        }

        assert_eq!(position_frames(&wires[1]).len(), 0);
    }

    #[test]
    fn test_phantom_wingman_loopback() {
        let _ = env_logger::init();

        let config = test_config();
        let wingman = PhantomCraft::Wingman(WingmanCraft::new(
            "com20",
            90.0,
            100.0,
            -35.0,
            [9001, 9002, 9003],
        ));
        let (mut relay, wires, _shutdown) = make_relay(&["com20"], vec![wingman], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        let mut now = run_to_running(&mut relay, t0, step, 1);

        // fix: due north, 100 m altitude
        let gps = RawGps {
            fix_type: msp::GPS_FIX_3D,
            num_sat: 12,
            msp_lat: 394907560,
            msp_lon: (-1050815770_i32) as u32,
            altitude_m: 100,
            speed: 0,
            course_decideg: 0,
            hdop: 110,
        };
        push_raw_gps(&wires[0], &gps);
        wires[0].borrow_mut().outbound.clear();

        for _ in 0..2 {
            relay.tick(now);
            now += step;
        }

        let forwarded = position_frames(&wires[0]);
        assert!(!forwarded.is_empty());

        let phantom = &forwarded[0];
        assert_eq!(phantom.craft_name, "phwing_com20");
        assert_eq!(phantom.uid, [9001, 9002, 9003]);
        assert_eq!(phantom.altitude_m, 65);

        // the phantom sits ~100 m due east of the injected position
        let start = GeoPoint::from_msp(gps.msp_lat, gps.msp_lon);
        let expected = geo::destination_point(&start, 90.0, 100.0);
        assert_eq!(phantom.msp_lat, expected.msp_lat());
        assert_eq!(phantom.msp_lon, expected.msp_lon());

        let rendered = GeoPoint::from_msp(phantom.msp_lat, phantom.msp_lon);
        assert!(rendered.lon_deg > start.lon_deg);
        assert!((rendered.lat_deg - start.lat_deg).abs() < 1e-5);
    }

    #[test]
    fn test_wingman_all_shadows_every_port() {
        let _ = env_logger::init();

        let config = test_config();
        let wingman = PhantomCraft::Wingman(WingmanCraft::new(
            "all",
            180.0,
            50.0,
            10.0,
            [7001, 7002, 7003],
        ));
        let (mut relay, wires, _shutdown) = make_relay(&["com20", "com21"], vec![wingman], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        push_identity(&wires[1], [40, 50, 60], "BravoQuad", true);

        let mut now = run_to_running(&mut relay, t0, step, 2);

        push_raw_gps(&wires[0], &sample_gps());
        push_raw_gps(&wires[1], &sample_gps());
        for wire in &wires {
            wire.borrow_mut().outbound.clear();
        }

        for _ in 0..2 {
            relay.tick(now);
            now += step;
        }

        // each craft hears the wingman shadowing itself
        for wire in &wires {
            let phantoms: Vec<CraftInfoAndPosition> = position_frames(wire)
                .into_iter()
                .filter(|info| info.craft_name == "phwing_all")
                .collect();
            assert!(!phantoms.is_empty());
            assert_eq!(phantoms[0].uid, [7001, 7002, 7003]);
        }
    }

    #[test]
    fn test_wingman_suppressed_when_reference_goes_stale() {
        let _ = env_logger::init();

        let config = test_config();
        let wingman = PhantomCraft::Wingman(WingmanCraft::new(
            "com20",
            90.0,
            100.0,
            0.0,
            [7, 8, 9],
        ));
        let (mut relay, wires, _shutdown) = make_relay(&["com20"], vec![wingman], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        let mut now = run_to_running(&mut relay, t0, step, 1);

        push_raw_gps(&wires[0], &sample_gps());
        for _ in 0..2 {
            relay.tick(now);
            now += step;
        }
        assert!(!position_frames(&wires[0]).is_empty());

        // once the craft's own fix ages out, the wingman has no fresh
        // reference and stops transmitting
        now += Duration::from_millis(4001);
        wires[0].borrow_mut().outbound.clear();
        for _ in 0..3 {
            relay.tick(now);
            now += step;
        }

        assert_eq!(position_frames(&wires[0]).len(), 0);
    }

    #[test]
    fn test_three_links_cross_forwarding() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) =
            make_relay(&["com20", "com21", "com22"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [1, 1, 1], "Alpha", true);
        push_identity(&wires[1], [2, 2, 2], "Bravo", true);
        push_identity(&wires[2], [3, 3, 3], "Charlie", true);

        let mut now = run_to_running(&mut relay, t0, step, 3);

        // Alpha and Charlie report fixes; Bravo stays silent
        push_raw_gps(&wires[0], &sample_gps());
        let mut charlie_gps = sample_gps();
        charlie_gps.msp_lat = 394999999;
        push_raw_gps(&wires[2], &charlie_gps);
        wires[1].borrow_mut().outbound.clear();

        for _ in 0..3 {
            relay.tick(now);
            now += step;
        }

        let forwarded = position_frames(&wires[1]);
        let mut uids: Vec<[u32; 3]> = forwarded.iter().map(|info| info.uid).collect();
        uids.sort();
        uids.dedup();

        assert_eq!(uids, vec![[1, 1, 1], [3, 3, 3]]);
    }

    #[test]
    fn test_controller_opt_out_suppresses_forwarding() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) = make_relay(&["com20", "com21"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        // controller B answers the setting query with 0
        push_identity(&wires[1], [40, 50, 60], "BravoQuad", false);

        let mut now = run_to_running(&mut relay, t0, step, 2);

        push_raw_gps(&wires[0], &sample_gps());
        wires[1].borrow_mut().outbound.clear();

        for _ in 0..6 {
            relay.tick(now);
            now += step;
        }

        // B still gets polled for GPS but never receives positions
        assert_eq!(position_frames(&wires[1]).len(), 0);
        assert!(outbound_frames(&wires[1])
            .iter()
            .any(|frame| frame.id == msp::MSP_RAW_GPS));
    }

    #[test]
    fn test_watchdog_restart_cycle() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) = make_relay(&["com20"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        push_identity(&wires[0], [10, 20, 30], "AlphaQuad", true);
        let now = run_to_running(&mut relay, t0, step, 1);

        // silence: no GPS ever arrives; 16 s after the initial open the
        // watchdog soft-resets the link
        let trip = now + Duration::from_millis(16_000);
        relay.tick(trip);
        assert_eq!(relay.link(0).state(), PortState::Closed);
        assert_eq!(relay.link(0).identity().variant, None);

        // the next tick reopens
        relay.tick(trip + step);
        assert_eq!(relay.link(0).state(), PortState::Opened);
    }

    #[test]
    fn test_round_robin_fairness() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, _shutdown) =
            make_relay(&["com20", "com21", "com22"], vec![], &config);
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        // opt everyone out so each running poll writes exactly one frame
        // (the GPS request)
        push_identity(&wires[0], [1, 1, 1], "Alpha", false);
        push_identity(&wires[1], [2, 2, 2], "Bravo", false);
        push_identity(&wires[2], [3, 3, 3], "Charlie", false);

        let mut now = run_to_running(&mut relay, t0, step, 3);
        assert_eq!(relay.next_index(), 0);

        for wire in &wires {
            wire.borrow_mut().outbound.clear();
        }

        for _ in 0..9 {
            relay.tick(now);
            now += step;
        }

        // 9 ticks over 3 links: each serviced exactly 3 times
        for wire in &wires {
            assert_eq!(outbound_frames(wire).len(), 3);
        }
        assert_eq!(relay.next_index(), 0);
    }

    #[test]
    fn test_shutdown_stops_ticks_and_cleanup_latches() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, wires, shutdown) = make_relay(&["com20"], vec![], &config);
        let t0 = Instant::now();

        relay.tick(t0);
        assert_eq!(relay.link(0).state(), PortState::Opened);

        shutdown.request();
        let open_count = wires[0].borrow().open_count;
        relay.tick(t0 + Duration::from_millis(100));
        assert_eq!(wires[0].borrow().open_count, open_count);

        relay.cleanup_and_shutdown();
        // a second entry is a no-op
        relay.cleanup_and_shutdown();
    }

    #[test]
    fn test_empty_port_list_ticks_harmlessly() {
        let _ = env_logger::init();

        let config = test_config();
        let (mut relay, _wires, _shutdown) = make_relay(&[], vec![], &config);
        relay.tick(Instant::now());
        assert_eq!(relay.next_index(), 0);
    }
}
