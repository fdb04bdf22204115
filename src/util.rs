// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tracing::debug;

const DEFAULT_EXP_FACTOR: f64 = 1.25;
const MAX_EXP_FACTOR: f64 = 60.0;

/// Exponential backoff. The first trigger returns the base delay, each
/// subsequent trigger multiplies by 1.25 until the factor reaches 60.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    base: Duration,
    exp_count: f64,
}

impl ExpBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            exp_count: 0.0,
        }
    }

    pub fn trigger(&mut self) -> Duration {
        let mut factor = DEFAULT_EXP_FACTOR.powf(self.exp_count);
        if factor < MAX_EXP_FACTOR {
            self.exp_count += 1.0;
        } else {
            factor = MAX_EXP_FACTOR;
        }

        let delay = self.base.mul_f64(factor);
        debug!(?delay, factor, "Backoff triggered");
        delay
    }

    pub fn reset(&mut self) {
        self.exp_count = 0.0;
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Moving average of a per-interval count, weighted like a load average over
/// five seconds. After five consecutive idle intervals the speed drops to zero.
pub fn calculate_speed(
    duration: Duration,
    speed: f64,
    count: f64,
    seconds_no_change: &mut u32,
) -> f64 {
    if count == 0.0 {
        *seconds_no_change += 1;
    } else {
        *seconds_no_change = 0;
    }

    if speed == 0.0 {
        return count;
    }

    if *seconds_no_change >= 5 {
        *seconds_no_change = 0;
        return 0.0;
    }

    count + (duration.as_secs_f64() / -5.0).exp() * (speed - count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let mut backoff = ExpBackoff::new(Duration::from_secs(1));
        assert_eq!(Duration::from_secs(1), backoff.trigger());
        assert_eq!(Duration::from_millis(1250), backoff.trigger());

        for _ in 0..100 {
            backoff.trigger();
        }
        assert_eq!(Duration::from_secs(60), backoff.trigger());

        backoff.reset();
        assert_eq!(Duration::from_secs(1), backoff.trigger());
    }

    #[test]
    fn speed_starts_from_first_count() {
        let mut idle = 0;
        assert_eq!(10.0, calculate_speed(Duration::from_secs(1), 0.0, 10.0, &mut idle));
        assert_eq!(0, idle);
    }

    #[test]
    fn speed_decays_towards_count() {
        let mut idle = 0;
        let speed = calculate_speed(Duration::from_secs(1), 10.0, 20.0, &mut idle);
        assert!(speed > 10.0 && speed < 20.0);
    }

    #[test]
    fn speed_zeroes_after_idle_run() {
        let mut idle = 0;
        let mut speed = 8.0;
        for _ in 0..4 {
            speed = calculate_speed(Duration::from_secs(1), speed, 0.0, &mut idle);
            assert!(speed > 0.0);
        }
        speed = calculate_speed(Duration::from_secs(1), speed, 0.0, &mut idle);
        assert_eq!(0.0, speed);
        assert_eq!(0, idle);
    }
}
