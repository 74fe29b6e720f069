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

//! The configuration record and its command line surface.

use std::fmt;

use clap::{App, Arg, ArgMatches};
use log::LogLevelFilter;

pub const DEFAULT_BAUD_RATE: u32 = 19200;
// On the bench this appears to be a decent default, but it has not been
// proved out in the field; it is configurable for a reason.
pub const DEFAULT_REFRESH_INTERVAL_MS: u32 = 100;
pub const DEFAULT_STALE_INTERVAL_MS: u32 = 4000;
pub const DEFAULT_LOG_LEVEL: LogLevelFilter = LogLevelFilter::Info;

#[derive(Debug, PartialEq, Clone)]
pub enum PortSelection {
    /// Scan the platform for likely serial devices.
    Auto,
    /// The user named the ports, valid or not.
    Explicit(Vec<String>),
}

impl PortSelection {
    pub fn detection_type_string(&self) -> &'static str {
        match *self {
            PortSelection::Auto => "Auto",
            PortSelection::Explicit(_) => "Explicit",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct WingmanSpec {
    pub target_port: String,
    pub bearing_offset_deg: f64,
    pub distance_m: f64,
    pub relative_alt_m: f64,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FixedCraftSpec {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub altitude_m: u16,
    pub course_decideg: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ports: PortSelection,
    pub baud: u32,
    pub refresh_interval_ms: u32,
    /// 0 disables stale suppression.
    pub stale_interval_ms: u32,
    pub log_level: LogLevelFilter,
    pub phantom_wingman: Option<WingmanSpec>,
    pub phantom_fixed: Vec<FixedCraftSpec>,
    pub exit_on_gps_loss: bool,
    pub omit_gps_pos: bool,
}

#[derive(Debug, PartialEq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new<S: Into<String>>(message: S) -> ConfigError {
        ConfigError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub fn cli() -> App<'static, 'static> {
    App::new("craftservices")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cross-informs MSP flight controllers about each other's GPS positions")
        .arg(
            Arg::with_name("ports")
                .long("ports")
                .takes_value(true)
                .value_name("PORTS")
                .help("Comma list of ports like 'com4,com20' or '/dev/ttyUSB0', or 'auto' to find \
                       ports automatically. Auto can work, but it is generally better to figure \
                       out your ports ahead of time and name them explicitly."),
        )
        .arg(
            Arg::with_name("baud")
                .long("baud")
                .takes_value(true)
                .value_name("BAUD")
                .help("Baud rate to use. 9600, 19200, 57600 for example."),
        )
        .arg(
            Arg::with_name("refresh")
                .long("refresh")
                .takes_value(true)
                .value_name("MS")
                .help("Refresh interval in milliseconds. 250 refreshes 4 times a second, 50 \
                       refreshes 20 times per second. Faster is generally better, up to the point \
                       you start dropping messages or get excessive errors."),
        )
        .arg(
            Arg::with_name("stale")
                .long("stale")
                .takes_value(true)
                .value_name("MS")
                .help("Stale interval in milliseconds. A received craft position older than this \
                       is considered stale and no longer forwarded to other crafts. 0 means \
                       positions never go stale."),
        )
        .arg(
            Arg::with_name("phantomwingman")
                .long("phantomwingman")
                .takes_value(true)
                .value_name("PORT|all,DEG,DIST_M,RELALT_M")
                .help("Testing mode: inject a phantom craft at the given angle, distance and \
                       relative altitude from the craft on the named port ('all' shadows every \
                       craft). For example 'com20,90,100,-35' puts a phantom wingman 100 meters \
                       to the immediate right of, and 35 meters below, the craft on com20."),
        )
        .arg(
            Arg::with_name("phantomfixed")
                .long("phantomfixed")
                .takes_value(true)
                .value_name("LAT,LON,ALT_M,COURSE_DECIDEG")
                .multiple(true)
                .number_of_values(1)
                .help("Testing mode: inject a phantom craft hovering at a fixed position. May be \
                       given more than once."),
        )
        .arg(
            Arg::with_name("loglevel")
                .long("loglevel")
                .takes_value(true)
                .value_name("LEVEL")
                .help("Log level: trace, debug, info, warn, err, critical or off, in level of \
                       priority. trace gives you everything, off gives you nothing, info is the \
                       in-between default."),
        )
        .arg(
            Arg::with_name("omitgpspos")
                .long("omitgpspos")
                .help("Omit exact GPS positions in logging output. Relative distances still \
                       appear."),
        )
        .arg(
            Arg::with_name("exitgpsloss")
                .long("exitgpsloss")
                .help("Exit when GPS is no longer heard from a running flight controller, so the \
                       program can be restarted by a batch file or service manager."),
        )
}

fn parse_u32(matches: &ArgMatches, name: &str, default: u32) -> Result<u32, ConfigError> {
    match matches.value_of(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::new(format!("invalid value for --{}: {}", name, value))),
        None => Ok(default),
    }
}

fn parse_log_level(value: &str) -> Result<LogLevelFilter, ConfigError> {
    match value.to_lowercase().as_str() {
        "trace" => Ok(LogLevelFilter::Trace),
        "debug" => Ok(LogLevelFilter::Debug),
        "info" => Ok(LogLevelFilter::Info),
        "warn" => Ok(LogLevelFilter::Warn),
        "err" => Ok(LogLevelFilter::Error),
        "critical" => Ok(LogLevelFilter::Error),
        "off" => Ok(LogLevelFilter::Off),
        other => Err(ConfigError::new(format!("unknown log level: {}", other))),
    }
}

fn parse_ports(value: &str) -> Result<PortSelection, ConfigError> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(PortSelection::Auto);
    }

    let mut names = Vec::new();
    for name in value.split(',') {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::new("empty port name in --ports list"));
        }
        names.push(name.to_string());
    }

    Ok(PortSelection::Explicit(names))
}

fn parse_wingman(value: &str) -> Result<WingmanSpec, ConfigError> {
    const INVALID: &'static str = "Invalid sub-arguments for phantomwingman argument";

    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 4 {
        return Err(ConfigError::new(INVALID));
    }

    let bearing_offset_deg = parts[1].parse().map_err(|_| ConfigError::new(INVALID))?;
    let distance_m = parts[2].parse().map_err(|_| ConfigError::new(INVALID))?;
    let relative_alt_m = parts[3].parse().map_err(|_| ConfigError::new(INVALID))?;

    Ok(WingmanSpec {
        target_port: parts[0].to_string(),
        bearing_offset_deg: bearing_offset_deg,
        distance_m: distance_m,
        relative_alt_m: relative_alt_m,
    })
}

fn parse_fixed(value: &str) -> Result<FixedCraftSpec, ConfigError> {
    const INVALID: &'static str = "Invalid sub-arguments for phantomfixed argument";

    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 4 {
        return Err(ConfigError::new(INVALID));
    }

    let lat_deg = parts[0].parse().map_err(|_| ConfigError::new(INVALID))?;
    let lon_deg = parts[1].parse().map_err(|_| ConfigError::new(INVALID))?;
    // altitude may be negative; it travels as its wire bit pattern
    let altitude_m: i16 = parts[2].parse().map_err(|_| ConfigError::new(INVALID))?;
    let course_decideg: u16 = parts[3].parse().map_err(|_| ConfigError::new(INVALID))?;

    if course_decideg >= 3600 {
        return Err(ConfigError::new(
            "phantomfixed course must be 0-3599 decidegrees",
        ));
    }

    Ok(FixedCraftSpec {
        lat_deg: lat_deg,
        lon_deg: lon_deg,
        altitude_m: altitude_m as u16,
        course_decideg: course_decideg,
    })
}

pub fn from_matches(matches: &ArgMatches) -> Result<Config, ConfigError> {
    let ports = match matches.value_of("ports") {
        Some(value) => parse_ports(value)?,
        None => PortSelection::Auto,
    };

    let baud = parse_u32(matches, "baud", DEFAULT_BAUD_RATE)?;
    let refresh_interval_ms = parse_u32(matches, "refresh", DEFAULT_REFRESH_INTERVAL_MS)?;
    if refresh_interval_ms == 0 {
        return Err(ConfigError::new("refresh interval must be greater than zero"));
    }
    let stale_interval_ms = parse_u32(matches, "stale", DEFAULT_STALE_INTERVAL_MS)?;

    let log_level = match matches.value_of("loglevel") {
        Some(value) => parse_log_level(value)?,
        None => DEFAULT_LOG_LEVEL,
    };

    let phantom_wingman = match matches.value_of("phantomwingman") {
        Some(value) => Some(parse_wingman(value)?),
        None => None,
    };

    let mut phantom_fixed = Vec::new();
    if let Some(values) = matches.values_of("phantomfixed") {
        for value in values {
            phantom_fixed.push(parse_fixed(value)?);
        }
    }

    Ok(Config {
        ports: ports,
        baud: baud,
        refresh_interval_ms: refresh_interval_ms,
        stale_interval_ms: stale_interval_ms,
        log_level: log_level,
        phantom_wingman: phantom_wingman,
        phantom_fixed: phantom_fixed,
        exit_on_gps_loss: matches.is_present("exitgpsloss"),
        omit_gps_pos: matches.is_present("omitgpspos"),
    })
}
