//! Per-binding mapping state machines.
//!
//! A [`MappingState`] is created at pedalboard load for every resolved
//! binding and driven by the router on the realtime thread. It owns all
//! transient state (edge detection, latch, tap timestamps) so bindings
//! behave identically across pedalboard swaps that re-resolve them.

use crate::binding::MappingKind;
use crate::event::MidiTimestamp;

/// Taps further apart than this restart the tap-tempo run.
const TAP_RESET_SECONDS: f64 = 2.0;

/// EMA smoothing factor for successive taps.
const TAP_ALPHA: f64 = 0.25;

/// Interval drift tolerated between consecutive taps before the run resets.
const TAP_MAX_DRIFT: f64 = 0.15;

/// Target-port metadata cached at resolution time.
#[derive(Clone, Debug, Default)]
pub struct PortRange {
    pub min: f32,
    pub max: f32,
    /// Integer port: mapped values round.
    pub integer: bool,
    /// Toggle port: values snap to min/max.
    pub toggled: bool,
    /// Enumeration scale-point values; mapped values quantize to these.
    pub scale_points: Vec<f32>,
}

/// Normalized router input for one matched event.
#[derive(Clone, Copy, Debug)]
pub enum MappingInput {
    Cc(u8),
    NoteOn,
    NoteOff,
    ProgramChange(u8),
}

/// Transient state for one resolved binding.
#[derive(Clone, Debug)]
pub struct MappingState {
    kind: MappingKind,
    range: PortRange,
    lo: f32,
    hi: f32,
    last_value: f32,
    has_last_value: bool,
    circular_accum: f32,
    last_cc_on: bool,
    latched_on: bool,
    trigger_pending: bool,
    last_tap: MidiTimestamp,
    last_interval: f64,
    smoothed_bpm: f64,
}

impl MappingState {
    /// `min`/`max` override the port's own range when the binding maps a
    /// subrange (e.g. an expression pedal sweeping only part of a dial).
    pub fn new(kind: MappingKind, range: PortRange, min: Option<f32>, max: Option<f32>) -> Self {
        let lo = min.unwrap_or(range.min);
        let hi = max.unwrap_or(range.max);
        Self {
            kind,
            lo,
            hi,
            range,
            last_value: lo,
            has_last_value: false,
            circular_accum: lo,
            last_cc_on: false,
            latched_on: false,
            trigger_pending: false,
            last_tap: MidiTimestamp::default(),
            last_interval: 0.0,
            smoothed_bpm: 0.0,
        }
    }

    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    /// Applies one matched event; returns the new control value, if any.
    pub fn apply(&mut self, input: MappingInput, timestamp: MidiTimestamp) -> Option<f32> {
        match self.kind {
            MappingKind::Linear => self.apply_linear(input),
            MappingKind::Circular => self.apply_circular(input),
            MappingKind::Momentary => self.apply_momentary(input),
            MappingKind::Latched => self.apply_latched(input),
            MappingKind::Trigger => self.apply_trigger(input),
            MappingKind::TapTempo => self.apply_tap_tempo(input, timestamp),
        }
        .map(|value| {
            self.last_value = value;
            self.has_last_value = true;
            value
        })
    }

    /// Called once at the end of each block; a pending trigger pulse falls
    /// back to the low value.
    pub fn end_of_block(&mut self) -> Option<f32> {
        if self.trigger_pending {
            self.trigger_pending = false;
            self.last_value = self.lo;
            Some(self.lo)
        } else {
            None
        }
    }

    fn apply_linear(&mut self, input: MappingInput) -> Option<f32> {
        match input {
            MappingInput::Cc(cc) => {
                let value = self.lo + (cc as f32 / 127.0) * (self.hi - self.lo);
                Some(self.quantize(value))
            }
            MappingInput::ProgramChange(program) => {
                // Program change selects an enumeration entry directly.
                self.range
                    .scale_points
                    .get(program as usize)
                    .copied()
                    .map(|v| v.clamp(self.lo.min(self.hi), self.hi.max(self.lo)))
            }
            _ => None,
        }
    }

    fn apply_circular(&mut self, input: MappingInput) -> Option<f32> {
        let MappingInput::Cc(cc) = input else {
            return None;
        };
        // One full-speed turn (delta 0.5) sweeps half the range; single
        // detents accumulate fractionally so integer ports still move.
        let step = self.hi - self.lo;
        let delta = (cc as f32 - 64.0) / 127.0;
        let base = if self.has_last_value {
            self.circular_accum
        } else {
            self.lo
        };
        let lo = self.lo.min(self.hi);
        let hi = self.lo.max(self.hi);
        let value = (base + delta * step).clamp(lo, hi);
        self.circular_accum = value;
        Some(self.quantize(value))
    }

    fn apply_momentary(&mut self, input: MappingInput) -> Option<f32> {
        match input {
            MappingInput::NoteOn => Some(self.hi),
            MappingInput::NoteOff => Some(self.lo),
            MappingInput::Cc(cc) => Some(if cc >= 64 { self.hi } else { self.lo }),
            MappingInput::ProgramChange(_) => None,
        }
    }

    fn apply_latched(&mut self, input: MappingInput) -> Option<f32> {
        if !self.positive_edge(input) {
            return None;
        }
        self.latched_on = !self.latched_on;
        Some(if self.latched_on { self.hi } else { self.lo })
    }

    fn apply_trigger(&mut self, input: MappingInput) -> Option<f32> {
        if !self.positive_edge(input) {
            return None;
        }
        self.trigger_pending = true;
        Some(self.hi)
    }

    fn apply_tap_tempo(&mut self, input: MappingInput, timestamp: MidiTimestamp) -> Option<f32> {
        if !self.positive_edge(input) {
            return None;
        }
        if self.last_tap.is_empty() {
            self.last_tap = timestamp;
            return None;
        }
        let interval = timestamp.diff(&self.last_tap);
        self.last_tap = timestamp;

        if interval <= 0.0 || interval > TAP_RESET_SECONDS {
            self.reset_tap_run();
            return None;
        }
        if self.last_interval > 0.0 {
            let drift = (interval - self.last_interval).abs() / self.last_interval;
            if drift > TAP_MAX_DRIFT {
                self.reset_tap_run();
                self.last_tap = timestamp;
                return None;
            }
        }
        self.last_interval = interval;

        let bpm = 60.0 / interval;
        self.smoothed_bpm = if self.smoothed_bpm <= 0.0 {
            bpm
        } else {
            self.smoothed_bpm + TAP_ALPHA * (bpm - self.smoothed_bpm)
        };
        Some((self.smoothed_bpm as f32).clamp(self.lo.min(self.hi), self.hi.max(self.lo)))
    }

    fn reset_tap_run(&mut self) {
        self.last_interval = 0.0;
        self.smoothed_bpm = 0.0;
    }

    /// Rising edge: note-on, or CC crossing the on threshold upward.
    fn positive_edge(&mut self, input: MappingInput) -> bool {
        match input {
            MappingInput::NoteOn => true,
            MappingInput::NoteOff => {
                self.last_cc_on = false;
                false
            }
            MappingInput::Cc(cc) => {
                let on = cc >= 64;
                let edge = on && !self.last_cc_on;
                self.last_cc_on = on;
                edge
            }
            MappingInput::ProgramChange(_) => false,
        }
    }

    fn quantize(&self, value: f32) -> f32 {
        let lo = self.lo.min(self.hi);
        let hi = self.lo.max(self.hi);
        let value = value.clamp(lo, hi);
        if !self.range.scale_points.is_empty() {
            return self
                .range
                .scale_points
                .iter()
                .copied()
                .min_by(|a, b| {
                    (a - value)
                        .abs()
                        .partial_cmp(&(b - value).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(value);
        }
        if self.range.toggled {
            return if value >= (lo + hi) * 0.5 { hi } else { lo };
        }
        if self.range.integer {
            return value.round();
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn range(min: f32, max: f32) -> PortRange {
        PortRange {
            min,
            max,
            ..Default::default()
        }
    }

    fn ts(millis: u64) -> MidiTimestamp {
        MidiTimestamp::new(millis / 1000, ((millis % 1000) * 1_000_000) as u32)
    }

    #[test]
    fn test_linear_scales_cc_range() {
        let mut m = MappingState::new(MappingKind::Linear, range(0.0, 10.0), None, None);
        assert_abs_diff_eq!(m.apply(MappingInput::Cc(0), ts(0)).unwrap(), 0.0);
        assert_abs_diff_eq!(m.apply(MappingInput::Cc(127), ts(0)).unwrap(), 10.0);
        let mid = m.apply(MappingInput::Cc(64), ts(0)).unwrap();
        assert!((mid - 5.04).abs() < 0.01);
    }

    #[test]
    fn test_linear_integer_rounds() {
        let mut port = range(0.0, 4.0);
        port.integer = true;
        let mut m = MappingState::new(MappingKind::Linear, port, None, None);
        let v = m.apply(MappingInput::Cc(64), ts(0)).unwrap();
        assert_eq!(v, 2.0);
    }

    #[test]
    fn test_linear_enum_quantizes_to_scale_points() {
        let mut port = range(0.0, 3.0);
        port.scale_points = vec![0.0, 1.0, 2.0, 3.0];
        let mut m = MappingState::new(MappingKind::Linear, port, None, None);
        let v = m.apply(MappingInput::Cc(50), ts(0)).unwrap();
        assert_eq!(v, 1.0);
    }

    #[test]
    fn test_program_change_selects_enum_entry() {
        let mut port = range(0.0, 3.0);
        port.scale_points = vec![0.0, 1.0, 2.0, 3.0];
        let mut m = MappingState::new(MappingKind::Linear, port, None, None);
        assert_eq!(m.apply(MappingInput::ProgramChange(2), ts(0)), Some(2.0));
        assert_eq!(m.apply(MappingInput::ProgramChange(9), ts(0)), None);
    }

    #[test]
    fn test_circular_steps_relative() {
        let mut m = MappingState::new(MappingKind::Circular, range(0.0, 1.0), None, None);
        let up = m.apply(MappingInput::Cc(65), ts(0)).unwrap();
        assert!(up > 0.0 && up < 0.1, "one detent moved {up}");
        let up2 = m.apply(MappingInput::Cc(65), ts(0)).unwrap();
        assert!(up2 > up);
        let down = m.apply(MappingInput::Cc(63), ts(0)).unwrap();
        assert!(down < up2);
        // Clamped at the ends.
        for _ in 0..200 {
            m.apply(MappingInput::Cc(0), ts(0));
        }
        assert_eq!(m.apply(MappingInput::Cc(63), ts(0)).unwrap(), 0.0);
    }

    #[test]
    fn test_momentary_follows_state() {
        let mut m = MappingState::new(MappingKind::Momentary, range(0.0, 1.0), None, None);
        assert_eq!(m.apply(MappingInput::NoteOn, ts(0)), Some(1.0));
        assert_eq!(m.apply(MappingInput::NoteOff, ts(0)), Some(0.0));
        assert_eq!(m.apply(MappingInput::Cc(127), ts(0)), Some(1.0));
        assert_eq!(m.apply(MappingInput::Cc(0), ts(0)), Some(0.0));
    }

    #[test]
    fn test_latched_toggles_on_positive_edges() {
        let mut m = MappingState::new(MappingKind::Latched, range(0.0, 1.0), None, None);
        assert_eq!(m.apply(MappingInput::Cc(127), ts(0)), Some(1.0));
        // Still held: no retrigger.
        assert_eq!(m.apply(MappingInput::Cc(127), ts(0)), None);
        assert_eq!(m.apply(MappingInput::Cc(0), ts(0)), None);
        assert_eq!(m.apply(MappingInput::Cc(127), ts(0)), Some(0.0));
    }

    #[test]
    fn test_trigger_pulses_for_one_block() {
        let mut m = MappingState::new(MappingKind::Trigger, range(0.0, 1.0), None, None);
        assert_eq!(m.apply(MappingInput::NoteOn, ts(0)), Some(1.0));
        assert_eq!(m.end_of_block(), Some(0.0));
        assert_eq!(m.end_of_block(), None);
    }

    #[test]
    fn test_tap_tempo_exact_taps() {
        let mut m = MappingState::new(MappingKind::TapTempo, range(40.0, 240.0), None, None);
        let mut value = None;
        for i in 0..8 {
            if let Some(v) = m.apply(MappingInput::Cc(127), ts(i * 500)) {
                value = Some(v);
            }
            m.apply(MappingInput::Cc(0), ts(i * 500 + 100));
        }
        let bpm = value.expect("tap tempo produced no value");
        assert!((bpm - 120.0).abs() < 1.0, "got {bpm} bpm");
    }

    #[test]
    fn test_tap_tempo_converges_within_one_percent() {
        let mut m = MappingState::new(MappingKind::TapTempo, range(40.0, 240.0), None, None);
        let mut value = 0.0f32;
        for i in 0..10 {
            if let Some(v) = m.apply(MappingInput::NoteOn, ts(i * 750)) {
                value = v;
            }
        }
        let expected = 60.0 / 0.75;
        assert!((value - expected).abs() / expected < 0.01, "got {value} bpm");
    }

    #[test]
    fn test_tap_tempo_resets_after_long_gap() {
        let mut m = MappingState::new(MappingKind::TapTempo, range(40.0, 240.0), None, None);
        m.apply(MappingInput::NoteOn, ts(0));
        m.apply(MappingInput::NoteOn, ts(500));
        // 5 s gap: run resets, next tap starts a new run.
        assert_eq!(m.apply(MappingInput::NoteOn, ts(5500)), None);
        let v = m.apply(MappingInput::NoteOn, ts(6000)).unwrap();
        assert_abs_diff_eq!(v, 120.0, epsilon = 0.5);
    }

    #[test]
    fn test_tap_tempo_drift_resets() {
        let mut m = MappingState::new(MappingKind::TapTempo, range(40.0, 240.0), None, None);
        m.apply(MappingInput::NoteOn, ts(100));
        assert!(m.apply(MappingInput::NoteOn, ts(600)).is_some());
        // 30% drift between consecutive intervals.
        assert_eq!(m.apply(MappingInput::NoteOn, ts(1250)), None);
    }

    #[test]
    fn test_tap_tempo_clamps_to_port_range() {
        let mut m = MappingState::new(MappingKind::TapTempo, range(40.0, 100.0), None, None);
        m.apply(MappingInput::NoteOn, ts(100));
        let v = m.apply(MappingInput::NoteOn, ts(600)).unwrap();
        assert_eq!(v, 100.0);
    }
}
