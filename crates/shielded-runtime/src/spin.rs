use std::time::Duration;

/// Exponential-backoff spin helper for `CheckLockAndEnlist` (§9 "Spin
/// bounds"). Spins tightly for a handful of iterations, then yields to the
/// scheduler, then sleeps for a capped, growing duration so a long-held
/// lock does not pin a waiting thread to its core.
pub(crate) struct SpinWait {
    iterations: u32,
}

const SPIN_LIMIT: u32 = 8;
const YIELD_LIMIT: u32 = 24;
const MAX_SLEEP_MICROS: u64 = 2_000;

impl SpinWait {
    pub(crate) fn new() -> Self {
        SpinWait { iterations: 0 }
    }

    pub(crate) fn spin(&mut self) {
        if self.iterations < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.iterations < YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let shift = (self.iterations - YIELD_LIMIT).min(10);
            let micros = (1u64 << shift).min(MAX_SLEEP_MICROS);
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.iterations = self.iterations.saturating_add(1);
    }
}
