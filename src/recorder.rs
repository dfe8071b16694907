//! Call recorder - saves decoded caller audio to a WAV file per stream

use crate::codec::SAMPLE_RATE;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub struct CallRecorder {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    samples: u64,
}

impl CallRecorder {
    /// Create `<dir>/<stream_sid>.wav`, 8 kHz mono 16-bit.
    pub fn create(dir: &Path, stream_sid: &str) -> Result<Self, hound::Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.wav", file_stem(stream_sid)));

        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;
        info!("Recording call audio to {:?}", path);

        Ok(Self {
            path,
            writer: Some(writer),
            samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, pcm: &[i16]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for &sample in pcm {
            if let Err(e) = writer.write_sample(sample) {
                error!("Failed to write audio sample: {}", e);
                // A broken file stays broken; stop recording
                self.writer = None;
                return;
            }
        }
        self.samples += pcm.len() as u64;
    }

    /// Flush the header and close the file.
    pub fn finish(mut self) {
        self.finalize();
    }

    fn finalize(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => debug!(
                    "Closed recording {:?} ({} ms)",
                    self.path,
                    self.samples * 1000 / SAMPLE_RATE as u64
                ),
                Err(e) => error!("Failed to finalize recording {:?}: {}", self.path, e),
            }
        }
    }
}

impl Drop for CallRecorder {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Keep stream ids from escaping the recording directory
fn file_stem(stream_sid: &str) -> String {
    let stem: String = stream_sid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "stream".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_wav() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CallRecorder::create(dir.path(), "MZ123").unwrap();
        let path = recorder.path().to_path_buf();
        recorder.write(&[0, 1000, -1000, i16::MAX]);
        recorder.write(&[]);
        recorder.finish();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 1000, -1000, i16::MAX]);
    }

    #[test]
    fn test_drop_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut recorder = CallRecorder::create(&dir.path().join("nested"), "abc").unwrap();
            recorder.write(&[5; 160]);
            recorder.path().to_path_buf()
        };
        assert_eq!(hound::WavReader::open(&path).unwrap().len(), 160);
    }

    #[test]
    fn test_stream_sid_is_sanitized() {
        assert_eq!(file_stem("../../etc/passwd"), "______etc_passwd");
        assert_eq!(file_stem(""), "stream");
        assert_eq!(file_stem("MZ-1_a"), "MZ-1_a");
    }
}
