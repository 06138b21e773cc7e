//! Simulated clock.
//!
//! Maps wall-clock seconds to simulated minutes through a speed
//! multiplier: `speed = 1.0` means one real second advances the simulation
//! by one minute. Speed changes re-anchor the mapping so they never move
//! simulated time backwards or jump it forwards retroactively.

use std::time::Instant;

/// Minimum accepted speed multiplier.
pub const MIN_SPEED: f64 = 0.1;

/// Largest slice of simulated minutes advanced in one step, so that speed
/// changes and commands take effect promptly mid-tick.
pub const MAX_SLICE_MINUTES: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct SimClock {
    speed: f64,
    wall_anchor: Instant,
    sim_anchor: f64,
    paused: bool,
}

impl SimClock {
    pub fn new(speed: f64) -> Self {
        Self {
            speed: speed.max(MIN_SPEED),
            wall_anchor: Instant::now(),
            sim_anchor: 0.0,
            paused: false,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// The simulated minute the engine should have reached by now.
    pub fn target_now(&self) -> f64 {
        if self.paused {
            return self.sim_anchor;
        }
        self.sim_anchor + self.wall_anchor.elapsed().as_secs_f64() * self.speed
    }

    /// Change the speed multiplier, effective from the current simulated
    /// instant. Values below [`MIN_SPEED`] are clamped.
    pub fn set_speed(&mut self, speed: f64) {
        let now = self.target_now();
        self.sim_anchor = now;
        self.wall_anchor = Instant::now();
        self.speed = speed.max(MIN_SPEED);
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.sim_anchor = self.target_now();
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.wall_anchor = Instant::now();
            self.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn advances_speed_minutes_per_second() {
        let clock = SimClock::new(60.0);
        sleep(Duration::from_millis(100));
        let target = clock.target_now();
        // 0.1 s at 60 min/s ≈ 6 simulated minutes; generous upper bound
        // for slow CI schedulers.
        assert!(target > 4.0 && target < 60.0, "target = {target}");
    }

    #[test]
    fn speed_change_is_anchored() {
        let mut clock = SimClock::new(1.0);
        sleep(Duration::from_millis(50));
        let before = clock.target_now();
        clock.set_speed(600.0);
        sleep(Duration::from_millis(100));
        let after = clock.target_now();
        assert!(after >= before);
        // 0.1 s at 600 min/s ≈ 60 simulated minutes past the anchor.
        assert!(after - before > 30.0, "delta = {}", after - before);
    }

    #[test]
    fn pause_freezes_time() {
        let mut clock = SimClock::new(100.0);
        sleep(Duration::from_millis(20));
        clock.pause();
        let frozen = clock.target_now();
        sleep(Duration::from_millis(50));
        assert_eq!(clock.target_now(), frozen);

        clock.resume();
        sleep(Duration::from_millis(20));
        assert!(clock.target_now() > frozen);
    }

    #[test]
    fn sub_minimum_speed_is_clamped() {
        let mut clock = SimClock::new(0.0);
        assert_eq!(clock.speed(), MIN_SPEED);
        clock.set_speed(0.001);
        assert_eq!(clock.speed(), MIN_SPEED);
    }
}
