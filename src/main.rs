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

#[macro_use]
extern crate log;
extern crate chrono;
extern crate clap;
#[cfg(test)]
extern crate env_logger;
extern crate libc;
#[macro_use]
extern crate nom;
extern crate serial;
extern crate time;

mod config;
mod geo;
mod link;
mod logger;
mod msp;
mod phantom;
mod relay;

use std::env;
use std::process;

use config::{Config, PortSelection};
use geo::GeoPoint;
use link::session::LinkSession;
use link::transport::{self, SerialTransport};
use phantom::{FixedCraft, PhantomCraft, UidGenerator, WingmanCraft};
use relay::shutdown::{self, ShutdownFlag};
use relay::Relay;

fn version_string() -> String {
    format!("CraftServices v{}", env!("CARGO_PKG_VERSION"))
}

fn build_phantom_crafts(config: &Config) -> Vec<PhantomCraft> {
    let mut uids = UidGenerator::new();
    let mut phantoms = Vec::new();

    if let Some(ref spec) = config.phantom_wingman {
        let craft = PhantomCraft::Wingman(WingmanCraft::new(
            &spec.target_port,
            spec.bearing_offset_deg,
            spec.distance_m,
            spec.relative_alt_m,
            uids.next_uid(),
        ));
        info!("Phantom Wingman: {}", craft.parameters_string());
        phantoms.push(craft);
    }

    for (index, spec) in config.phantom_fixed.iter().enumerate() {
        let name = format!("phfixed_{:02}", index + 1);
        let craft = PhantomCraft::Fixed(FixedCraft::new(
            &name,
            uids.next_uid(),
            GeoPoint::from_degrees(spec.lat_deg, spec.lon_deg),
            spec.altitude_m,
            spec.course_decideg,
        ));
        info!("Phantom Fixed Craft: {}", craft.parameters_string());
        phantoms.push(craft);
    }

    phantoms
}

fn run() -> i32 {
    // no arguments at all means the user wants to know how this works
    if env::args().len() <= 1 {
        let mut app = config::cli();
        let _ = app.print_long_help();
        println!();
        return 0;
    }

    let matches = match config::cli().get_matches_from_safe(env::args()) {
        Ok(matches) => matches,
        // --help and --version land here; exit() prints and picks the code
        Err(err) => err.exit(),
    };

    let config = match config::from_matches(&matches) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("craftservices: {}", err);
            return 2;
        }
    };

    // all log file names of a run share one UTC stamp
    let stamp = logger::run_stamp();

    let port_names = match config.ports {
        PortSelection::Auto => transport::enumerate_ports(),
        PortSelection::Explicit(ref names) => names.clone(),
    };

    if let Err(err) = logger::init(config.log_level, &stamp, &port_names) {
        eprintln!("craftservices: could not set up logging: {}", err);
        return 2;
    }

    info!("{}", version_string());
    info!("Port detection type: {}", config.ports.detection_type_string());
    info!("Ports:{}", port_names.iter().fold(String::new(), |acc, name| acc + " " + name));
    info!("Baud Rate: {}", config.baud);
    info!("Refresh Rate: {} ms", config.refresh_interval_ms);
    info!("Stale Interval: {} ms", config.stale_interval_ms);
    info!("Exit on GPS Loss: {}", config.exit_on_gps_loss);
    info!("Omit GPS Position: {}", config.omit_gps_pos);

    let phantoms = build_phantom_crafts(&config);

    let flag = ShutdownFlag::new();
    shutdown::install_interrupt_handler();

    // each configured port gets a session; they start off closed and the
    // relay loop opens them as it services each in turn
    let mut links = Vec::with_capacity(port_names.len());
    for name in &port_names {
        links.push(LinkSession::new(
            name,
            Box::new(SerialTransport::new(name)),
            &config,
            flag.clone(),
        ));
        info!("Created flight controller link to monitor {}.", name);
    }

    Relay::new(links, phantoms, config.refresh_interval_ms, flag).run();

    0
}

fn main() {
    process::exit(run());
}
