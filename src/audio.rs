//! WAV file I/O.
//!
//! The vocoder emits 32-bit IEEE-float mono PCM at the model's sample rate;
//! this module wraps it in a RIFF/WAVE container.

use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::{Error, Result};

/// Write mono f32 samples to a WAV file.
pub fn write_wav(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a mono f32 WAV file back into samples.
pub fn read_wav(path: &Path) -> Result<(u32, Vec<f32>)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(Error::InvalidFormat(format!(
            "wav: expected mono, got {} channels",
            spec.channels
        )));
    }

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, _>>()?,
        SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<f32>, _>>()?
        }
    };

    Ok((spec.sample_rate, samples))
}
