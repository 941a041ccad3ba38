use std::{
    fmt::Display,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use indicatif::{ProgressBar, ProgressStyle};
use prost::Message;

use crate::{
    config::LoggingConfig,
    error::Result,
    tracker::{EpochMode, EpochSummary},
    TrainingError,
};

const LOG_TARGET: &str = "training";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub show_progress: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            show_progress: config.show_progress,
            tensorboard_dir: config.tensorboard_dir.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }

    pub fn quiet() -> Self {
        Self {
            show_progress: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }
}

/// Log sink of one worker. Only the designated writer emits anything;
/// every other worker holds a muted logger.
pub struct Logger {
    enabled: bool,
    settings: LoggingSettings,
    tensorboard: Option<Mutex<TensorBoardWriter>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings, enabled: bool) -> Result<Self> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) if enabled => Some(Mutex::new(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)),
            _ => None,
        };
        Ok(Self {
            enabled,
            settings,
            tensorboard,
        })
    }

    pub fn muted() -> Self {
        Self {
            enabled: false,
            settings: LoggingSettings::quiet(),
            tensorboard: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn debug(&self, message: impl Display) {
        if self.enabled {
            log::debug!(target: LOG_TARGET, "{message}");
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.enabled {
            log::info!(target: LOG_TARGET, "{message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        if self.enabled {
            log::warn!(target: LOG_TARGET, "{message}");
        }
    }

    pub fn error(&self, message: impl Display) {
        if self.enabled {
            log::error!(target: LOG_TARGET, "{message}");
        }
    }

    /// Mirrors an epoch summary into the scalar dashboard, if one is open.
    pub fn record_epoch(&self, summary: &EpochSummary) {
        let Some(writer) = self.tensorboard.as_ref() else {
            return;
        };
        let Ok(mut writer) = writer.lock() else {
            return;
        };
        match summary.mode {
            EpochMode::Train => {
                if let Some(loss) = summary.loss {
                    let step = summary.timestamp.train_epoch as i64;
                    let _ = writer.write_scalar("train/loss", step, loss);
                }
            }
            EpochMode::Valid => {
                let step = summary.timestamp.valid_epoch as i64;
                for (name, value) in summary.as_dict() {
                    let _ = writer.write_scalar(&format!("valid/{name}"), step, value);
                }
            }
        }
    }

    pub fn progress(&self, len: usize, label: impl Into<String>) -> ProgressBar {
        if !(self.enabled && self.settings.show_progress) {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{msg:>14} [{bar:30}] {pos}/{len} {elapsed_precise}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(label.into());
        bar
    }

    pub fn flush(&self) {
        if let Some(writer) = self.tensorboard.as_ref() {
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
