//! Temporary WAV files for file-based playback backends.

use std::io::{self, BufWriter};
use std::path::PathBuf;

/// Write mono 16-bit PCM to a uniquely named temp WAV file.
///
/// The file is persisted (not deleted on drop); the caller's handle owns
/// deletion once playback finishes or is stopped.
pub fn write_temp_wav(pcm: &[u8], sample_rate: u32) -> io::Result<PathBuf> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let temp_file = tempfile::Builder::new()
        .prefix("arietta_preview_")
        .suffix(".wav")
        .tempfile()?;

    let mut writer = hound::WavWriter::new(BufWriter::new(temp_file.reopen()?), spec)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    temp_file
        .into_temp_path()
        .keep()
        .map_err(|e| e.error)
}

/// Playback length in seconds of a mono 16-bit PCM buffer.
pub fn pcm_duration_seconds(pcm: &[u8], sample_rate: u32) -> f64 {
    pcm.len() as f64 / (sample_rate.max(1) as f64 * 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_wav_is_valid_mono_16bit() {
        let samples: Vec<u8> = (0..200i16)
            .flat_map(|v| (v * 100).to_le_bytes())
            .collect();
        let path = write_temp_wav(&samples, 22050).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.len(), 200);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_pcm_duration() {
        // One second of mono 16-bit audio at 22050 Hz is 44100 bytes.
        assert!((pcm_duration_seconds(&[0u8; 44100], 22050) - 1.0).abs() < 1e-9);
    }
}
