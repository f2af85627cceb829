//! Periodic `parking_lot` deadlock reports.
//!
//! Only does anything with the `deadlock-detection` feature. The only
//! `parking_lot` lock in the relay is the mutex inside
//! [`SessionRegistry`](crate::server::SessionRegistry), which the accept
//! loops and every finishing session take.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// How often the detector wakes up.
#[cfg(feature = "deadlock-detection")]
const CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Start the detector thread, once per process.
#[cfg(feature = "deadlock-detection")]
pub fn try_spawn_deadlock_detection() {
    use std::{sync::OnceLock, thread};
    use tracing::{debug, error};

    static DETECTOR: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

    DETECTOR.get_or_init(|| {
        thread::spawn(|| {
            debug!("checking for deadlocks every {CHECK_INTERVAL:?}");
            loop {
                thread::sleep(CHECK_INTERVAL);
                for (n, threads) in parking_lot::deadlock::check_deadlock().iter().enumerate() {
                    error!("deadlock {n} involves {} threads", threads.len());
                    for thread in threads {
                        error!("thread {:?}:\n{:?}", thread.thread_id(), thread.backtrace());
                    }
                }
            }
        })
    });
}

/// No-op without the `deadlock-detection` feature.
#[cfg(not(feature = "deadlock-detection"))]
pub fn try_spawn_deadlock_detection() {}
