//! Built-in utility effects.
//!
//! The appliance hosts third-party plugin binaries through wrappers that
//! implement [`Plugin`]; these built-ins cover the utility slots every rig
//! needs (gain trim, tremolo) and give the test-suite real processors with
//! the same port-metadata shape external plugins expose.

use crate::effect::{ControlPortInfo, Plugin};

pub const GAIN_URI: &str = "builtin://gain";
pub const TREMOLO_URI: &str = "builtin://tremolo";

#[inline]
fn db_to_amplitude(db: f32) -> f32 {
    10.0f32.powf(db * 0.05)
}

/// Mono gain trim with an output-level meter port.
pub struct Gain {
    ports: Vec<ControlPortInfo>,
    amplitude: f32,
    gain_db: f32,
    level: f32,
}

impl Gain {
    pub fn new() -> Self {
        Self {
            ports: vec![
                ControlPortInfo::input("gain", "Gain", -60.0, 24.0, 0.0),
                ControlPortInfo::output("level", "Level", -96.0, 24.0),
            ],
            amplitude: 1.0,
            gain_db: 0.0,
            level: -96.0,
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Gain {
    fn uri(&self) -> &str {
        GAIN_URI
    }

    fn ports(&self) -> &[ControlPortInfo] {
        &self.ports
    }

    fn audio_io(&self) -> (usize, usize) {
        (1, 1)
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    fn set_control(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.gain_db = value;
            self.amplitude = db_to_amplitude(value);
        }
    }

    fn get_control(&self, index: usize) -> f32 {
        match index {
            0 => self.gain_db,
            1 => self.level,
            _ => 0.0,
        }
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        let mut peak = 0.0f32;
        for frame in 0..frames {
            let v = input[frame] * self.amplitude;
            output[frame] = v;
            peak = peak.max(v.abs());
        }
        self.level = if peak > 0.0 {
            20.0 * peak.log10()
        } else {
            -96.0
        };
    }
}

/// Mono tremolo; rate is BPM-valued so it makes a natural tap-tempo target.
pub struct Tremolo {
    ports: Vec<ControlPortInfo>,
    rate_bpm: f32,
    depth: f32,
    phase: f32,
    phase_inc: f32,
    sample_rate: f64,
}

impl Tremolo {
    pub fn new() -> Self {
        Self {
            ports: vec![
                ControlPortInfo::input("rate", "Rate", 40.0, 240.0, 120.0),
                ControlPortInfo::input("depth", "Depth", 0.0, 1.0, 0.5),
            ],
            rate_bpm: 120.0,
            depth: 0.5,
            phase: 0.0,
            phase_inc: 0.0,
            sample_rate: 48_000.0,
        }
    }

    fn update_phase_inc(&mut self) {
        let hz = self.rate_bpm as f64 / 60.0;
        self.phase_inc = (hz / self.sample_rate) as f32;
    }
}

impl Default for Tremolo {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Tremolo {
    fn uri(&self) -> &str {
        TREMOLO_URI
    }

    fn ports(&self) -> &[ControlPortInfo] {
        &self.ports
    }

    fn audio_io(&self) -> (usize, usize) {
        (1, 1)
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        self.sample_rate = sample_rate;
        self.phase = 0.0;
        self.update_phase_inc();
    }

    fn set_control(&mut self, index: usize, value: f32) {
        match index {
            0 => {
                self.rate_bpm = value.clamp(40.0, 240.0);
                self.update_phase_inc();
            }
            1 => self.depth = value.clamp(0.0, 1.0),
            _ => {}
        }
    }

    fn get_control(&self, index: usize) -> f32 {
        match index {
            0 => self.rate_bpm,
            1 => self.depth,
            _ => 0.0,
        }
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        for frame in 0..frames {
            let lfo = (self.phase * std::f32::consts::TAU).sin() * 0.5 + 0.5;
            let gain = 1.0 - self.depth * lfo;
            output[frame] = input[frame] * gain;
            self.phase += self.phase_inc;
            if self.phase >= 1.0 {
                self.phase -= 1.0;
            }
        }
    }
}
