//! Millisecond pacing helpers for the ~30 fps worker loops.
//!
//! Both keep the sub-millisecond remainder of each measurement and fold it
//! back in once it adds up, so truncation doesn't drift the rate.

use std::time::{Duration, Instant};

/// 1000 / 30, rounded down.
pub const MS_PER_FRAME: u64 = 33;

/// Splits the elapsed time since `last` into whole milliseconds, carrying
/// leftover microseconds in `excess_us`.
fn take_elapsed_ms(last: &mut Instant, excess_us: &mut u64, now: Instant) -> u64 {
    let us = now.saturating_duration_since(*last).as_micros() as u64;
    *last = now;
    *excess_us += us % 1000;
    let carried = *excess_us / 1000;
    *excess_us %= 1000;
    us / 1000 + carried
}

/// Accumulates elapsed wall-clock time and hands it out in fixed chunks.
/// Recording uses it to pad or drop frames so the written frame count
/// tracks real time rather than the source's delivery rate.
#[derive(Debug, Clone)]
pub struct GrabTimer {
    last: Instant,
    excess_us: u64,
    accum_ms: u64,
}

impl GrabTimer {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last: now,
            excess_us: 0,
            accum_ms: 0,
        }
    }

    /// Restart the clock with `start_ms` already banked.
    pub fn reset(&mut self, start_ms: u64) {
        self.reset_at(start_ms, Instant::now());
    }

    pub fn reset_at(&mut self, start_ms: u64, now: Instant) {
        self.last = now;
        self.excess_us = 0;
        self.accum_ms = start_ms;
    }

    /// Take `ms` out of the bank if that much has accumulated.
    pub fn grab(&mut self, ms: u64) -> bool {
        self.grab_at(ms, Instant::now())
    }

    pub fn grab_at(&mut self, ms: u64, now: Instant) -> bool {
        self.accum_ms += take_elapsed_ms(&mut self.last, &mut self.excess_us, now);
        if self.accum_ms >= ms {
            self.accum_ms -= ms;
            return true;
        }
        false
    }

    pub fn banked_ms(&self) -> u64 {
        self.accum_ms
    }
}

impl Default for GrabTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Measures how long an iteration took and says how much of a frame budget
/// is left to sleep. Each query restarts the measurement.
#[derive(Debug, Clone)]
pub struct FrameBudget {
    last: Instant,
    excess_us: u64,
}

impl FrameBudget {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last: now,
            excess_us: 0,
        }
    }

    pub fn restart(&mut self) {
        self.last = Instant::now();
    }

    /// Milliseconds still to wait for `budget_ms` to have passed since the
    /// last call. Zero on overrun.
    ///
    /// The interval runs from the previous call and so includes the sleep
    /// that followed it. Loops paced this way run slower than a fixed period.
    pub fn ms_left(&mut self, budget_ms: u64) -> u64 {
        self.ms_left_at(budget_ms, Instant::now())
    }

    pub fn ms_left_at(&mut self, budget_ms: u64, now: Instant) -> u64 {
        let spent = take_elapsed_ms(&mut self.last, &mut self.excess_us, now);
        budget_ms.saturating_sub(spent)
    }

    /// Sleep for what's left of one frame, but never less than `min_ms`.
    pub fn sleep_rest_of_frame(&mut self, min_ms: u64) {
        let ms = self.ms_left(MS_PER_FRAME).max(min_ms);
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl Default for FrameBudget {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn grab_needs_enough_banked_time() {
        let t0 = Instant::now();
        let mut timer = GrabTimer::starting_at(t0);
        assert!(!timer.grab_at(33, t0 + ms(20)));
        assert!(timer.grab_at(33, t0 + ms(40)));
        // 7ms left over
        assert_eq!(timer.banked_ms(), 7);
    }

    #[test]
    fn reset_banks_a_frame() {
        let t0 = Instant::now();
        let mut timer = GrabTimer::starting_at(t0);
        timer.reset_at(MS_PER_FRAME, t0);
        assert!(timer.grab_at(MS_PER_FRAME, t0));
        assert!(!timer.grab_at(MS_PER_FRAME, t0));
    }

    #[test]
    fn slow_source_yields_several_grabs() {
        let t0 = Instant::now();
        let mut timer = GrabTimer::starting_at(t0);
        let later = t0 + ms(100);
        let mut n = 0;
        while timer.grab_at(MS_PER_FRAME, later) {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[test]
    fn microsecond_remainders_carry() {
        let t0 = Instant::now();
        let mut timer = GrabTimer::starting_at(t0);
        let mut now = t0;
        // 4 x 0.5ms = 2ms
        for _ in 0..4 {
            now += Duration::from_micros(500);
            timer.grab_at(1000, now);
        }
        assert_eq!(timer.banked_ms(), 2);
    }

    #[test]
    fn budget_counts_down_and_floors_at_zero() {
        let t0 = Instant::now();
        let mut budget = FrameBudget::starting_at(t0);
        assert_eq!(budget.ms_left_at(33, t0 + ms(10)), 23);
        // measured from the previous call
        assert_eq!(budget.ms_left_at(33, t0 + ms(60)), 0);
        // the sleep taken after a query counts against the next budget
        assert_eq!(budget.ms_left_at(33, t0 + ms(80)), 13);
    }
}
