//! Pitch helpers for the preview synthesiser.

/// Convert a MIDI pitch to its equal-temperament frequency in Hz.
///
/// Pitches outside the MIDI range map to 0.0, which downstream code treats
/// as "render silence for this note".
pub fn midi_to_frequency(pitch: i32) -> f64 {
    if !(0..=127).contains(&pitch) {
        return 0.0;
    }
    440.0 * 2f64.powf((pitch - 69) as f64 / 12.0)
}
