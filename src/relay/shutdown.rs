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

//! Process-wide shutdown signalling.
//!
//! The signal handler is the only code outside the relay loop thread and
//! it performs exactly one atomic store. Every loop-side handler checks
//! the flag before acting; the actual teardown happens on the loop thread.

use std::sync::atomic::{AtomicBool, Ordering, ATOMIC_BOOL_INIT};
use std::sync::Arc;

use libc;

// Written by the signal handler, which cannot carry state of its own.
static INTERRUPT_REQUESTED: AtomicBool = ATOMIC_BOOL_INIT;

/// The shutdown request flag shared by the relay, its link sessions and
/// `main`. Cloning hands out another handle to the same flag.
#[derive(Clone)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag {
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst) || INTERRUPT_REQUESTED.load(Ordering::SeqCst)
    }
}

extern "C" fn handle_interrupt(_signum: libc::c_int) {
    INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() {}
