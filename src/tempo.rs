//! Tempo Map - affine beats/seconds mapping plus bar bookkeeping
//!
//! `beats = (seconds - base_seconds) * tempo + base_beats`, tempo in beats
//! per second. Tempo and meter changes re-anchor the map at the point of
//! change, so positions expressed in beats keep their musical meaning.

use crate::error::{ClockError, Result};

/// Round `x` up to the next multiple of `q`.
fn round_up(x: f64, q: f64) -> f64 {
    if q == 0.0 {
        return x;
    }
    (x / q).ceil() * q
}

#[derive(Clone, Debug, PartialEq)]
pub struct TempoMap {
    tempo: f64,
    base_beats: f64,
    base_seconds: f64,
    beats_per_bar: f64,
    base_bar_beat: f64,
    base_bar: f64,
}

impl TempoMap {
    /// Identity map: one beat per second, anchored at zero.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0)
    }

    /// Map with `tempo` beats per second where `beats` falls on `seconds`.
    pub fn new(tempo: f64, beats: f64, seconds: f64, beats_per_bar: f64) -> Self {
        Self {
            tempo,
            base_beats: beats,
            base_seconds: seconds,
            beats_per_bar,
            base_bar_beat: beats,
            base_bar: 0.0,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn base_beats(&self) -> f64 {
        self.base_beats
    }

    pub fn base_seconds(&self) -> f64 {
        self.base_seconds
    }

    pub fn beats_per_bar(&self) -> f64 {
        self.beats_per_bar
    }

    pub fn base_bar_beat(&self) -> f64 {
        self.base_bar_beat
    }

    pub fn base_bar(&self) -> f64 {
        self.base_bar
    }

    pub fn secs2beats(&self, seconds: f64) -> f64 {
        (seconds - self.base_seconds) * self.tempo + self.base_beats
    }

    /// Inverse of `secs2beats`. A stalled map (tempo 0) never reaches a
    /// later beat.
    pub fn beats2secs(&self, beats: f64) -> f64 {
        if self.tempo == 0.0 {
            return if beats > self.base_beats {
                f64::INFINITY
            } else {
                self.base_seconds
            };
        }
        (beats - self.base_beats) / self.tempo + self.base_seconds
    }

    /// Change tempo keeping `beats` at the same physical time.
    pub fn set_tempo_at_beat(&mut self, tempo: f64, beats: f64) {
        self.base_seconds = self.beats2secs(beats);
        self.base_beats = beats;
        self.tempo = tempo;
    }

    /// Change tempo keeping the beat at `seconds` unchanged.
    pub fn set_tempo_at_sec(&mut self, tempo: f64, seconds: f64) {
        self.base_beats = self.secs2beats(seconds);
        self.base_seconds = seconds;
        self.tempo = tempo;
    }

    /// Change the meter with the new bar grid starting at `beats`.
    pub fn set_meter_at_beat(&mut self, beats_per_bar: f64, beats: f64) -> Result<()> {
        if !beats_per_bar.is_finite() || beats_per_bar <= 0.0 {
            return Err(ClockError::InvalidMeter(beats_per_bar));
        }
        self.base_bar = self.beats2bars(beats);
        self.base_bar_beat = beats;
        self.beats_per_bar = beats_per_bar;
        Ok(())
    }

    pub fn beats2bars(&self, beats: f64) -> f64 {
        (beats - self.base_bar_beat) / self.beats_per_bar + self.base_bar
    }

    pub fn bars2beats(&self, bars: f64) -> f64 {
        (bars - self.base_bar) * self.beats_per_bar + self.base_bar_beat
    }

    /// Index of the bar containing `beats`.
    pub fn bar(&self, beats: f64) -> f64 {
        self.beats2bars(beats).floor()
    }

    /// First bar line at or after `beats`.
    pub fn next_bar(&self, beats: f64) -> f64 {
        self.bars2beats(self.beats2bars(beats).ceil())
    }

    /// Offset of `beats` from the start of its bar.
    pub fn beat_in_bar(&self, beats: f64) -> f64 {
        beats - self.bars2beats(self.bar(beats))
    }

    /// Next beat at or after `beats` on the grid `quant`, shifted by `phase`.
    ///
    /// `quant == 0` disables the grid; a negative `quant` counts bars.
    pub fn next_time_on_grid(&self, beats: f64, quant: f64, phase: f64) -> f64 {
        if quant == 0.0 {
            return beats + phase;
        }
        let quant = if quant < 0.0 {
            self.beats_per_bar * -quant
        } else {
            quant
        };
        let phase = if phase < 0.0 { phase.rem_euclid(quant) } else { phase };
        round_up(beats - self.base_bar_beat - (phase % quant), quant) + self.base_bar_beat + phase
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_tempo() {
        let tm = TempoMap::new(2.0, 0.0, 0.0, 4.0); // 120 bpm

        assert!((tm.secs2beats(1.0) - 2.0).abs() < 1e-10);
        assert!((tm.secs2beats(0.5) - 1.0).abs() < 1e-10);
        assert!((tm.beats2secs(4.0) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_round_trip() {
        let tm = TempoMap::new(1.7, 3.0, 12.5, 4.0);
        for i in 0..100 {
            let s = i as f64 * 0.37 - 5.0;
            assert!((tm.beats2secs(tm.secs2beats(s)) - s).abs() < 1e-9);
        }
    }

    #[test]
    fn test_tempo_change_is_continuous() {
        let mut tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);

        // At t=2 we have 2 beats; double the tempo there.
        let before = tm.secs2beats(2.0);
        tm.set_tempo_at_beat(2.0, before);
        let after = tm.secs2beats(2.0);
        assert!((before - after).abs() < 1e-10);

        // One second later at 2 beats per second.
        assert!((tm.secs2beats(3.0) - 4.0).abs() < 1e-10);
    }

    #[test]
    fn test_tempo_change_at_seconds() {
        let mut tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        tm.set_tempo_at_sec(-1.0, 4.0);
        assert!((tm.secs2beats(4.0) - 4.0).abs() < 1e-10);
        assert!((tm.secs2beats(5.0) - 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_stalled_tempo_never_reaches_future_beats() {
        let mut tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        tm.set_tempo_at_beat(0.0, 2.0);
        assert_eq!(tm.beats2secs(3.0), f64::INFINITY);
        assert!((tm.beats2secs(2.0) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_bars() {
        let mut tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        assert_eq!(tm.bar(5.0), 1.0);
        assert_eq!(tm.next_bar(5.0), 8.0);
        assert_eq!(tm.next_bar(8.0), 8.0);
        assert_eq!(tm.beat_in_bar(5.5), 1.5);

        // Switch to 3/4 at beat 8 (start of bar 2).
        tm.set_meter_at_beat(3.0, 8.0).unwrap();
        assert_eq!(tm.base_bar(), 2.0);
        assert_eq!(tm.bars2beats(3.0), 11.0);
        assert_eq!(tm.next_bar(9.0), 11.0);

        assert!(matches!(
            tm.set_meter_at_beat(0.0, 8.0),
            Err(ClockError::InvalidMeter(_))
        ));
    }

    #[test]
    fn test_next_time_on_grid() {
        let tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);

        assert!((tm.next_time_on_grid(1.3, 0.0, 0.5) - 1.8).abs() < 1e-12);
        assert_eq!(tm.next_time_on_grid(1.3, 1.0, 0.0), 2.0);
        assert_eq!(tm.next_time_on_grid(2.0, 1.0, 0.0), 2.0);
        assert_eq!(tm.next_time_on_grid(1.3, 4.0, 0.0), 4.0);
        assert_eq!(tm.next_time_on_grid(1.3, 4.0, 1.0), 5.0);
        // Two bars of four beats.
        assert_eq!(tm.next_time_on_grid(1.3, -2.0, 0.0), 8.0);
        // Negative phase wraps into the grid.
        assert_eq!(tm.next_time_on_grid(1.3, 4.0, -1.0), 3.0);
    }

    #[test]
    fn test_grid_follows_bar_anchor() {
        let mut tm = TempoMap::new(1.0, 0.0, 0.0, 4.0);
        tm.set_meter_at_beat(4.0, 1.0).unwrap();
        assert_eq!(tm.next_time_on_grid(2.0, 4.0, 0.0), 5.0);
    }
}
