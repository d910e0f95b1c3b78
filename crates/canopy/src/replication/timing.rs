/// Longest frame delta fed into the physics clock. Anything past this is lost
/// rather than replayed.
const MAX_FRAME_DELTA: f32 = 0.25;

/// Splits variable frame deltas into whole physics steps of equal length.
#[derive(Debug, Clone)]
pub struct StepClock {
    step: f32,
    carry: f32,
}

impl StepClock {
    pub fn new(steps_per_second: u32) -> Self {
        Self {
            step: 1.0 / steps_per_second.max(1) as f32,
            carry: 0.0,
        }
    }

    /// Length of one step in seconds.
    pub fn step(&self) -> f32 {
        self.step
    }

    /// Number of whole steps that fit in the time carried so far plus `delta`.
    pub fn steps(&mut self, delta: f32) -> u32 {
        self.carry += delta.clamp(0.0, MAX_FRAME_DELTA);
        let mut due = 0;
        while self.carry >= self.step {
            self.carry -= self.step;
            due += 1;
        }
        due
    }
}

/// Fires at most once per `advance` when the interval has elapsed, then starts
/// over. Leftover time is dropped.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval: f32,
    elapsed: f32,
}

impl IntervalTimer {
    pub fn new(interval: f32) -> Self {
        Self {
            interval,
            elapsed: 0.0,
        }
    }

    pub fn advance(&mut self, delta: f32) -> bool {
        self.elapsed += delta;
        if self.elapsed >= self.interval {
            self.elapsed = 0.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_frames_are_capped() {
        let mut clock = StepClock::new(64);
        assert_eq!(clock.steps(10.0), 16);
        assert_eq!(clock.steps(0.0), 0);
    }

    #[test]
    fn short_frames_carry_over() {
        let mut clock = StepClock::new(10);
        assert_eq!(clock.steps(0.06), 0);
        assert_eq!(clock.steps(0.06), 1);
        assert_eq!(clock.steps(-1.0), 0);
    }

    #[test]
    fn interval_fires_once_and_restarts() {
        let mut timer = IntervalTimer::new(0.05);
        assert!(!timer.advance(0.03));
        assert!(timer.advance(0.03));
        assert!(!timer.advance(0.03));
        assert!(timer.advance(0.5));
        assert!(!timer.advance(0.0));
    }
}
