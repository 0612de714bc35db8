//! ttyrec-compatible recording of PTY output: per frame a 12-byte header
//! (seconds, microseconds, payload length, all little-endian u32) followed by
//! the payload. Optional gzip compression and size-based rotation.
//!
//! Recording is a best-effort observer. The first write failure disables the
//! recorder for the rest of the session; gameplay is never gated on it.

use crate::config::RecordingConfig;
use crate::error::{CoreError, Result};
use crate::model::Frame;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const TTYREC_HEADER_SIZE: u64 = 12;

enum RecordingSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl RecordingSink {
    fn open(path: &Path, gzip: bool) -> std::io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if gzip {
            RecordingSink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            RecordingSink::Plain(file)
        })
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            RecordingSink::Plain(w) => w.write_all(data),
            RecordingSink::Gzip(w) => w.write_all(data),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            RecordingSink::Plain(mut w) => w.flush(),
            RecordingSink::Gzip(w) => w.finish().map(|mut f| {
                let _ = f.flush();
            }),
        }
    }
}

/// Writes one session's output stream in ttyrec format.
pub struct TtyrecRecorder {
    dir: PathBuf,
    session_id: String,
    path: PathBuf,
    sink: Option<RecordingSink>,
    gzip: bool,
    max_file_bytes: Option<u64>,
    bytes_written: u64,
    rotations: u32,
    failed: bool,
}

impl TtyrecRecorder {
    /// Opens `{root}/recordings/{session_id}.ttyrec[.gz]`.
    pub fn create(root: &Path, session_id: &str, config: &RecordingConfig) -> Result<Self> {
        let dir = root.join("recordings");
        std::fs::create_dir_all(&dir)?;
        let path = recording_path(&dir, session_id, 0, config.gzip);
        let sink = RecordingSink::open(&path, config.gzip)
            .map_err(|e| CoreError::Io(e))?;
        Ok(TtyrecRecorder {
            dir,
            session_id: session_id.to_owned(),
            path,
            sink: Some(sink),
            gzip: config.gzip,
            max_file_bytes: config.max_file_bytes,
            bytes_written: 0,
            rotations: 0,
            failed: false,
        })
    }

    /// Path of the file currently being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one frame. Failures are logged once and disable the recorder.
    pub fn record(&mut self, frame: &Frame) {
        if self.failed || self.sink.is_none() {
            return;
        }
        let entry_len = TTYREC_HEADER_SIZE + frame.data.len() as u64;
        if let Some(max) = self.max_file_bytes {
            if self.bytes_written > 0 && self.bytes_written + entry_len > max {
                self.rotate();
                if self.failed {
                    return;
                }
            }
        }

        let seconds = (frame.timestamp_ns / 1_000_000_000) as u32;
        let microseconds = ((frame.timestamp_ns % 1_000_000_000) / 1_000) as u32;
        let mut header = [0u8; TTYREC_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&seconds.to_le_bytes());
        header[4..8].copy_from_slice(&microseconds.to_le_bytes());
        header[8..12].copy_from_slice(&(frame.data.len() as u32).to_le_bytes());

        let sink = self.sink.as_mut().expect("sink checked above");
        let outcome = sink
            .write_all(&header)
            .and_then(|()| sink.write_all(&frame.data));
        match outcome {
            Ok(()) => self.bytes_written += entry_len,
            Err(error) => {
                tracing::error!(
                    ?error,
                    session_id = %self.session_id,
                    path = %self.path.display(),
                    "recording failed, disabling recorder for this session"
                );
                self.failed = true;
                self.sink = None;
            }
        }
    }

    /// Closes the current file and opens the next rotation sibling.
    fn rotate(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(error) = sink.finish() {
                tracing::warn!(?error, path = %self.path.display(), "failed to close recording");
            }
        }
        self.rotations += 1;
        self.path = recording_path(&self.dir, &self.session_id, self.rotations, self.gzip);
        match RecordingSink::open(&self.path, self.gzip) {
            Ok(sink) => {
                self.sink = Some(sink);
                self.bytes_written = 0;
                tracing::info!(path = %self.path.display(), "rotated recording");
            }
            Err(error) => {
                tracing::error!(?error, path = %self.path.display(), "recording rotation failed");
                self.failed = true;
            }
        }
    }

    /// Flushes and closes the recording.
    pub fn finish(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(error) = sink.finish() {
                tracing::warn!(?error, path = %self.path.display(), "failed to finish recording");
            }
        }
    }
}

fn recording_path(dir: &Path, session_id: &str, rotation: u32, gzip: bool) -> PathBuf {
    let suffix = if gzip { ".ttyrec.gz" } else { ".ttyrec" };
    if rotation == 0 {
        dir.join(format!("{session_id}{suffix}"))
    } else {
        dir.join(format!("{session_id}.{rotation}{suffix}"))
    }
}

/// One decoded recording entry, for replay tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyrecEntry {
    pub seconds: u32,
    pub microseconds: u32,
    pub data: Vec<u8>,
}

/// Decodes a recording file for replay. Gzip is detected from the file name.
/// A truncated file surfaces an integrity error.
pub fn read_ttyrec(path: &Path) -> Result<Vec<TtyrecEntry>> {
    use std::io::Read;

    let raw = if path.extension().is_some_and(|ext| ext == "gz") {
        let file = File::open(path)?;
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(file).read_to_end(&mut decoded)?;
        decoded
    } else {
        std::fs::read(path)?
    };

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < raw.len() {
        if raw.len() - offset < TTYREC_HEADER_SIZE as usize {
            return Err(CoreError::Integrity(format!(
                "truncated ttyrec header in {}",
                path.display()
            )));
        }
        let seconds = u32::from_le_bytes(raw[offset..offset + 4].try_into().expect("4 bytes"));
        let microseconds =
            u32::from_le_bytes(raw[offset + 4..offset + 8].try_into().expect("4 bytes"));
        let len =
            u32::from_le_bytes(raw[offset + 8..offset + 12].try_into().expect("4 bytes")) as usize;
        offset += TTYREC_HEADER_SIZE as usize;
        if raw.len() - offset < len {
            return Err(CoreError::Integrity(format!(
                "truncated ttyrec payload in {}",
                path.display()
            )));
        }
        entries.push(TtyrecEntry {
            seconds,
            microseconds,
            data: raw[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(id: u64, timestamp_ns: i64, data: &[u8]) -> Frame {
        Frame {
            id,
            timestamp_ns,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn writes_headers_and_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig::default();
        let mut recorder = TtyrecRecorder::create(dir.path(), "sid", &config).unwrap();

        recorder.record(&frame(1, 5_000_250_000, b"hello"));
        recorder.record(&frame(2, 6_500_000_000, b"world!"));
        let path = recorder.path().to_path_buf();
        recorder.finish();

        let entries = read_ttyrec(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                TtyrecEntry {
                    seconds: 5,
                    microseconds: 250,
                    data: b"hello".to_vec(),
                },
                TtyrecEntry {
                    seconds: 6,
                    microseconds: 500_000,
                    data: b"world!".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn gzip_recordings_decode_to_the_same_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            gzip: true,
            ..RecordingConfig::default()
        };
        let mut recorder = TtyrecRecorder::create(dir.path(), "sid", &config).unwrap();
        assert!(recorder.path().to_string_lossy().ends_with(".ttyrec.gz"));

        recorder.record(&frame(1, 1_000_000_000, b"compressed"));
        let path = recorder.path().to_path_buf();
        recorder.finish();

        let entries = read_ttyrec(&path).unwrap();
        assert_eq!(
            entries,
            vec![TtyrecEntry {
                seconds: 1,
                microseconds: 0,
                data: b"compressed".to_vec(),
            }]
        );
    }

    #[test]
    fn rotates_once_the_size_cap_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            max_file_bytes: Some(40),
            ..RecordingConfig::default()
        };
        let mut recorder = TtyrecRecorder::create(dir.path(), "sid", &config).unwrap();

        recorder.record(&frame(1, 0, b"0123456789")); // 22 bytes
        recorder.record(&frame(2, 0, b"0123456789")); // 44 > 40, rotates first
        recorder.finish();

        let first = dir.path().join("recordings/sid.ttyrec");
        let second = dir.path().join("recordings/sid.1.ttyrec");
        assert_eq!(read_ttyrec(&first).unwrap().len(), 1);
        assert_eq!(read_ttyrec(&second).unwrap().len(), 1);
    }

    #[test]
    fn truncated_recordings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttyrec");
        // Header promises 100 payload bytes, file ends after 3.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(&100u32.to_le_bytes());
        raw.extend_from_slice(b"abc");
        std::fs::write(&path, &raw).unwrap();

        let err = read_ttyrec(&path).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(_)));
    }
}
