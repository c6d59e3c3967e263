//! Enhanced-audio output sinks.
//!
//! A closed set of capabilities chosen at startup: `file_sink` writes a
//! mono 32-bit float WAV, `virtual_mic` streams raw f32 PCM into a FIFO
//! whose OS-side plumbing lives outside the core.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use crate::config::{SinkConfig, SinkKind};
use crate::error::{FocusFieldError, Result};
use crate::messages::EnhancedAudio;

pub enum OutputSink {
    FileSink(WavSink),
    VirtualMic(FifoSink),
}

impl OutputSink {
    pub fn from_config(config: &SinkConfig, sample_rate_hz: u32) -> Result<Self> {
        match config.kind {
            SinkKind::FileSink => Ok(OutputSink::FileSink(WavSink::create(
                &config.file_path,
                sample_rate_hz,
            )?)),
            SinkKind::VirtualMic => {
                Ok(OutputSink::VirtualMic(FifoSink::open(&config.fifo_path)?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputSink::FileSink(_) => "sink.file",
            OutputSink::VirtualMic(_) => "sink.virtual_mic",
        }
    }

    pub fn handle(&mut self, block: &EnhancedAudio) -> Result<()> {
        match self {
            OutputSink::FileSink(sink) => sink.write(block),
            OutputSink::VirtualMic(sink) => sink.write(block),
        }
    }

    /// Flushes and finalizes the output. Called once on shutdown.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            OutputSink::FileSink(sink) => sink.finish(),
            OutputSink::VirtualMic(sink) => sink.finish(),
        }
    }
}

/// Mono float WAV writer.
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: &std::path::Path, sample_rate_hz: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate_hz,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| {
            FocusFieldError::SinkFailed {
                message: format!("failed to create WAV at {}: {e}", path.display()),
            }
        })?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    fn write(&mut self, block: &EnhancedAudio) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| FocusFieldError::SinkFailed {
            message: "WAV sink already finalized".to_string(),
        })?;
        for &sample in &block.samples {
            writer
                .write_sample(sample)
                .map_err(|e| FocusFieldError::SinkFailed {
                    message: format!("WAV write failed: {e}"),
                })?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(|e| FocusFieldError::SinkFailed {
                message: format!("WAV finalize failed: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Raw little-endian f32 PCM into a FIFO (or any writable path).
pub struct FifoSink {
    writer: BufWriter<File>,
}

impl FifoSink {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FocusFieldError::SinkFailed {
                message: format!("failed to open FIFO at {}: {e}", path.display()),
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, block: &EnhancedAudio) -> Result<()> {
        for &sample in &block.samples {
            self.writer
                .write_all(&sample.to_le_bytes())
                .map_err(|e| FocusFieldError::SinkFailed {
                    message: format!("FIFO write failed: {e}"),
                })?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| FocusFieldError::SinkFailed {
            message: format!("FIFO flush failed: {e}"),
        })
    }
}
