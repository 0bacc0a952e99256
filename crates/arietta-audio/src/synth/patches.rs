//! Timbre definitions selected by General-MIDI-like program number.
//!
//! Programs are grouped into 16 buckets of 8; each bucket shares one patch.
//! The table is static; patches are never created at runtime.

/// A timbre definition: harmonic content, envelope shape, and vibrato.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthPatch {
    /// (frequency multiple, amplitude) pairs summed per sample
    pub harmonics: &'static [(f64, f64)],
    /// Attack length as a ratio of the note length
    pub attack_ratio: f64,
    /// Release length as a ratio of the note length
    pub release_ratio: f64,
    /// Overall gain applied after the envelope
    pub gain: f64,
    /// Vibrato rate in Hz (0 disables vibrato)
    pub vibrato_hz: f64,
    /// Vibrato depth as a fraction of the phase step
    pub vibrato_depth: f64,
}

const fn patch(
    harmonics: &'static [(f64, f64)],
    attack_ratio: f64,
    release_ratio: f64,
    gain: f64,
) -> SynthPatch {
    SynthPatch {
        harmonics,
        attack_ratio,
        release_ratio,
        gain,
        vibrato_hz: 0.0,
        vibrato_depth: 0.0,
    }
}

const fn vibrato_patch(
    harmonics: &'static [(f64, f64)],
    attack_ratio: f64,
    release_ratio: f64,
    gain: f64,
    vibrato_hz: f64,
    vibrato_depth: f64,
) -> SynthPatch {
    SynthPatch {
        harmonics,
        attack_ratio,
        release_ratio,
        gain,
        vibrato_hz,
        vibrato_depth,
    }
}

const DEFAULT_PATCH: SynthPatch = patch(&[(1.0, 1.0)], 0.02, 0.1, 1.0);
const PIANO: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.35), (3.0, 0.2)], 0.01, 0.35, 1.1);
const MALLET: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.6), (3.0, 0.3)], 0.005, 0.25, 1.0);
const ORGAN: SynthPatch = patch(
    &[(1.0, 1.0), (2.0, 0.9), (3.0, 0.7), (4.0, 0.5)],
    0.02,
    0.08,
    0.9,
);
const GUITAR: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.55), (3.0, 0.25)], 0.01, 0.28, 0.9);
const BASS: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.4), (3.0, 0.15)], 0.02, 0.22, 1.0);
const STRINGS: SynthPatch = vibrato_patch(
    &[(1.0, 0.9), (2.0, 0.45), (3.0, 0.2)],
    0.08,
    0.35,
    0.95,
    5.0,
    0.003,
);
const BRASS: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.6), (3.0, 0.3)], 0.04, 0.28, 1.05);
const REED: SynthPatch = vibrato_patch(
    &[(1.0, 1.0), (2.0, 0.5), (3.0, 0.25)],
    0.05,
    0.25,
    0.95,
    5.5,
    0.004,
);
const FLUTE: SynthPatch = vibrato_patch(&[(1.0, 1.0), (2.0, 0.12)], 0.03, 0.18, 0.9, 5.5, 0.006);
const SYNTH_LEAD: SynthPatch = patch(
    &[(1.0, 1.0), (2.0, 0.7), (3.0, 0.5), (4.0, 0.3)],
    0.01,
    0.12,
    1.0,
);
const SYNTH_PAD: SynthPatch = vibrato_patch(
    &[(1.0, 1.0), (2.0, 0.7), (3.0, 0.4)],
    0.08,
    0.45,
    1.0,
    4.0,
    0.005,
);
const PLUCKED: SynthPatch = patch(&[(1.0, 1.0), (2.0, 0.4), (4.0, 0.2)], 0.005, 0.2, 0.9);

/// Look up the patch for a program number, clamped into 0-127.
pub fn patch_for_program(program: u8) -> &'static SynthPatch {
    match program.min(127) {
        0..=7 => &PIANO,
        8..=15 => &MALLET,
        16..=23 => &ORGAN,
        24..=31 => &GUITAR,
        32..=39 => &BASS,
        40..=55 => &STRINGS,
        56..=63 => &BRASS,
        64..=71 => &REED,
        72..=79 => &FLUTE,
        80..=87 => &SYNTH_LEAD,
        88..=95 => &SYNTH_PAD,
        96..=103 => &PLUCKED,
        _ => &DEFAULT_PATCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(patch_for_program(0), &PIANO);
        assert_eq!(patch_for_program(7), &PIANO);
        assert_eq!(patch_for_program(8), &MALLET);
        assert_eq!(patch_for_program(79), &FLUTE);
        assert_eq!(patch_for_program(104), &DEFAULT_PATCH);
        assert_eq!(patch_for_program(127), &DEFAULT_PATCH);
    }

    #[test]
    fn test_vibrato_only_where_defined() {
        assert_eq!(patch_for_program(0).vibrato_hz, 0.0);
        assert!(patch_for_program(72).vibrato_hz > 0.0);
    }
}
