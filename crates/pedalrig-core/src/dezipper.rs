//! dB-stepped volume ramp for zipper-free gain changes.
//!
//! [`DbDezipper`] ramps the *decibel* value at a fixed rate and interpolates
//! the linear amplitude across 64-frame segments, so a 96 dB swing always
//! takes `rate_seconds` regardless of where it starts. Call
//! [`tick()`](DbDezipper::tick) once per frame in the audio callback; once
//! the ramp lands on its target the tick collapses to a single load.

/// Frames per interpolation segment. The dB ramp advances once per segment;
/// the amplitude is linearly interpolated in between.
const SEGMENT_SIZE: i32 = 64;

/// Full ramp span in dB: a `rate_seconds` ramp traverses 96 dB.
const FULL_RANGE_DB: f32 = 96.0;

#[inline]
fn db_to_amplitude(db: f32) -> f32 {
    10.0f32.powf(db * 0.05)
}

/// Per-effect volume ramp state machine.
#[derive(Debug, Clone)]
pub struct DbDezipper {
    min_db: f32,
    sample_rate: f64,
    rate_seconds: f32,
    target_db: f32,
    current_db: f32,
    target_x: f32,
    x: f32,
    dx: f32,
    count: i32,
    db_per_segment: f32,
}

impl DbDezipper {
    pub fn new(sample_rate: f64) -> Self {
        let mut dezipper = Self {
            min_db: -96.0,
            sample_rate,
            rate_seconds: 0.1,
            target_db: -96.0,
            current_db: -96.0,
            target_x: 0.0,
            x: 0.0,
            dx: 0.0,
            count: -1,
            db_per_segment: 0.0,
        };
        dezipper.update_segment_rate();
        dezipper
    }

    fn update_segment_rate(&mut self) {
        self.db_per_segment =
            (FULL_RANGE_DB / self.rate_seconds) * SEGMENT_SIZE as f32 / self.sample_rate as f32;
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.update_segment_rate();
    }

    /// Sets the time a full-range (96 dB) ramp takes.
    pub fn set_rate(&mut self, seconds: f32) {
        self.rate_seconds = seconds;
        self.update_segment_rate();
    }

    /// Values at or below `min_db` snap the amplitude to exactly zero.
    pub fn set_min_db(&mut self, min_db: f32) {
        self.min_db = min_db;
        if self.target_db < min_db {
            self.target_db = min_db;
            self.count = 0;
        }
        if self.current_db < min_db {
            self.current_db = min_db;
            self.x = 0.0;
            self.target_x = 0.0;
            self.dx = 0.0;
            self.count = 0;
        }
    }

    /// Starts ramping toward `db`. Realtime-safe.
    #[inline]
    pub fn set_target(&mut self, db: f32) {
        let db = db.max(self.min_db);
        if db != self.target_db {
            self.target_db = db;
            self.count = 0;
        }
    }

    /// Jumps to `db` with no ramp.
    pub fn reset(&mut self, db: f32) {
        let value = if db <= self.min_db {
            0.0
        } else {
            db_to_amplitude(db)
        };
        self.x = value;
        self.target_x = value;
        self.dx = 0.0;
        self.current_db = db;
        self.target_db = db;
        self.count = -1;
    }

    /// True once the ramp has landed and `tick()` is a plain load.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.count < 0
    }

    #[inline]
    pub fn target_db(&self) -> f32 {
        self.target_db
    }

    /// Returns the amplitude for the current frame and advances one frame.
    #[inline]
    pub fn tick(&mut self) -> f32 {
        if self.count >= 0 {
            if self.count == 0 {
                self.next_segment();
            } else {
                self.count -= 1;
            }
            let result = self.x;
            self.x += self.dx;
            return result;
        }
        self.x
    }

    /// Applies the ramp as a gain onto `buffer` in place.
    #[inline]
    pub fn apply_gain(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample *= self.tick();
        }
    }

    /// Writes `input * gain` into `output`.
    #[inline]
    pub fn apply_gain_to(&mut self, input: &[f32], output: &mut [f32]) {
        for (out, inp) in output.iter_mut().zip(input.iter()) {
            *out = *inp * self.tick();
        }
    }

    fn next_segment(&mut self) {
        if self.target_db == self.current_db {
            self.x = self.target_x;
            self.dx = 0.0;
            if self.target_db <= self.min_db {
                self.x = 0.0;
            }
            self.count = -1;
            return;
        } else if self.target_db < self.current_db {
            self.current_db -= self.db_per_segment;
            if self.current_db < self.target_db {
                self.current_db = self.target_db;
            }
        } else {
            self.current_db += self.db_per_segment;
            if self.current_db > self.target_db {
                self.current_db = self.target_db;
            }
        }
        self.target_x = db_to_amplitude(self.current_db);
        self.dx = (self.target_x - self.x) / SEGMENT_SIZE as f32;
        self.count = SEGMENT_SIZE - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_reset_lands_on_amplitude() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(0.0);
        assert!(dz.is_idle());
        assert_abs_diff_eq!(dz.tick(), 1.0, epsilon = 1e-6);

        dz.reset(-6.0);
        assert_abs_diff_eq!(dz.tick(), db_to_amplitude(-6.0), epsilon = 1e-6);
    }

    #[test]
    fn test_below_min_snaps_to_zero() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(-96.0);
        assert_eq!(dz.tick(), 0.0);
    }

    #[test]
    fn test_ramp_reaches_target() {
        let sample_rate = 48000.0;
        let mut dz = DbDezipper::new(sample_rate);
        dz.set_rate(0.1);
        dz.reset(-12.0);
        dz.set_target(0.0);
        assert!(!dz.is_idle());

        // 12 dB out of the 96 dB full range: an eighth of the rate time.
        let worst_case = (0.1 * sample_rate) as usize;
        for _ in 0..worst_case {
            dz.tick();
        }
        assert!(dz.is_idle());
        assert_abs_diff_eq!(dz.tick(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_ramp_block_bound() {
        // A full-range step settles within rate_seconds * sample_rate /
        // block_size blocks, give or take one block.
        let sample_rate = 48000.0;
        let block_size = 64usize;
        let rate = 0.05f32;
        let mut dz = DbDezipper::new(sample_rate);
        dz.set_rate(rate);
        dz.reset(-96.0);
        dz.set_target(0.0);

        let bound = (rate as f64 * sample_rate / block_size as f64).ceil() as usize + 1;
        let mut blocks = 0;
        let mut buf = vec![1.0f32; block_size];
        while !dz.is_idle() {
            dz.apply_gain(&mut buf);
            buf.fill(1.0);
            blocks += 1;
            assert!(blocks <= bound, "ramp exceeded {bound} blocks");
        }
    }

    #[test]
    fn test_monotonic_ramp_up() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(-40.0);
        dz.set_target(-3.0);
        let mut last = dz.tick();
        for _ in 0..48000 {
            let v = dz.tick();
            assert!(v >= last - 1e-6, "ramp went backwards: {last} -> {v}");
            last = v;
        }
    }

    #[test]
    fn test_retarget_mid_ramp() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(-96.0);
        dz.set_target(0.0);
        for _ in 0..1000 {
            dz.tick();
        }
        dz.set_target(-96.0);
        for _ in 0..96000 {
            dz.tick();
        }
        assert!(dz.is_idle());
        assert_eq!(dz.tick(), 0.0);
    }

    #[test]
    fn test_idle_tick_is_stable() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(-6.0);
        let a = dz.tick();
        let b = dz.tick();
        assert_eq!(a, b);
    }

    #[test]
    fn test_target_clamped_to_min() {
        let mut dz = DbDezipper::new(48000.0);
        dz.reset(0.0);
        dz.set_target(-200.0);
        assert_eq!(dz.target_db(), -96.0);
    }
}
