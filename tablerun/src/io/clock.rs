//! Sleeping, behind a trait so settle intervals and dispatch spacing can be
//! observed in tests without waiting.

use std::thread;
use std::time::Duration;

pub trait Clock {
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}
