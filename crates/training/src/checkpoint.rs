//! On-disk training snapshots.
//!
//! Every validation writes `<stem>_<tag>-<serial>.<ext>` into the experiment
//! directory and the best snapshot is named by a small pointer file
//! `<stem>.<ext>` that records the best serial. Only the newest `max_keep`
//! numbered files survive a save.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    config::ExperimentConfig,
    context::RunContext,
    error::Result,
    model::StateDict,
    optimizer::OptimizerState,
    tracker::{EpochSummary, Timestamp},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const DEFAULT_TAG: &str = "epoch";
pub const DEFAULT_EXTENSION: &str = "pth";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model_state: StateDict,
    pub optimizer_state: OptimizerState,
    pub stopping_count: usize,
    pub valid_trigger_count: usize,
    pub best_valid_score: Option<f64>,
    pub best_valid_timestamp: Timestamp,
    /// Training epoch the snapshot was taken in.
    pub epoch: usize,
    pub timestamp: Timestamp,
    pub config: ExperimentConfig,
    pub summary: EpochSummary,
    pub valid_results: BTreeMap<usize, EpochSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestPointer {
    pub serial: usize,
    /// File name of the target, relative to the pointer's directory.
    pub file: String,
}

/// Envelope of every file in the store, keyed by what the file holds.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredFile {
    Record(Box<CheckpointRecord>),
    Pointer(BestPointer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestResolution {
    Missing,
    Present { serial: usize, path: PathBuf },
    /// The pointer names a serial whose file has been pruned.
    Dangling { serial: usize, path: PathBuf },
}

pub struct CheckpointStore {
    directory: PathBuf,
    stem: String,
    tag: String,
    extension: String,
    max_keep: usize,
    ctx: RunContext,
}

impl CheckpointStore {
    pub fn new(
        directory: impl Into<PathBuf>,
        stem: impl Into<String>,
        max_keep: usize,
        ctx: RunContext,
    ) -> Self {
        let max_keep = if max_keep == 0 {
            ctx.logger().warn(
                "max_save is 0 but at least one checkpoint is needed to resume, keeping 1",
            );
            1
        } else {
            max_keep
        };
        Self {
            directory: directory.into(),
            stem: stem.into(),
            tag: DEFAULT_TAG.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            max_keep,
            ctx,
        }
    }

    pub fn from_config(config: &ExperimentConfig, ctx: RunContext) -> Self {
        Self::new(
            config.checkpoint_dir(),
            config.experiment.filename(),
            config.training.max_save,
            ctx,
        )
    }

    pub fn with_naming(mut self, tag: impl Into<String>, extension: impl Into<String>) -> Self {
        self.tag = tag.into();
        self.extension = extension.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_keep(&self) -> usize {
        self.max_keep
    }

    pub fn record_path(&self, serial: usize) -> PathBuf {
        self.directory.join(self.record_file_name(serial))
    }

    pub fn best_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}.{}", self.stem, self.extension))
    }

    /// Writes the record for `serial`, repoints the best pointer at
    /// `best_serial` and prunes the oldest numbered files beyond `max_keep`.
    pub fn save(
        &self,
        record: &CheckpointRecord,
        serial: usize,
        best_serial: Option<usize>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let path = self.record_path(serial);
        write_json_atomic(&path, &StoredFile::Record(Box::new(record.clone())))?;
        self.ctx
            .logger()
            .info(format!("saved checkpoint to {}", path.display()));

        if let Some(best) = best_serial {
            let pointer = BestPointer {
                serial: best,
                file: self.record_file_name(best),
            };
            write_json_atomic(&self.best_path(), &StoredFile::Pointer(pointer))?;
        }

        self.rotate()?;
        Ok(path)
    }

    /// Serials of the numbered files on disk, ascending.
    pub fn list(&self) -> Result<Vec<usize>> {
        let mut serials = Vec::new();
        if !self.directory.exists() {
            return Ok(serials);
        }
        let prefix = format!("{}_{}-", self.stem, self.tag);
        let suffix = format!(".{}", self.extension);
        for entry in fs::read_dir(&self.directory).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to read checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let serial = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(serial) = serial {
                serials.push(serial);
            }
        }
        serials.sort_unstable();
        Ok(serials)
    }

    pub fn resolve_best(&self) -> Result<BestResolution> {
        let pointer_path = self.best_path();
        if !pointer_path.exists() {
            return Ok(BestResolution::Missing);
        }
        match read_json::<StoredFile>(&pointer_path)? {
            StoredFile::Pointer(pointer) => Ok(resolve_pointer(&pointer_path, pointer)),
            StoredFile::Record(_) => Err(TrainingError::checkpoint(format!(
                "{} is a checkpoint record, not a best pointer",
                pointer_path.display()
            ))),
        }
    }

    /// Serial the best pointer names, if its file still exists. A pruned
    /// target is logged as an error and reads as no best.
    pub fn surviving_best(&self) -> Result<Option<usize>> {
        match self.resolve_best()? {
            BestResolution::Present { serial, .. } => Ok(Some(serial)),
            BestResolution::Dangling { serial, path } => {
                self.ctx.logger().error(format!(
                    "best pointer names serial {serial} but {} was pruned",
                    path.display()
                ));
                Ok(None)
            }
            BestResolution::Missing => Ok(None),
        }
    }

    /// Loads a record or follows a best pointer to one. A missing file, or a
    /// pointer whose target has been pruned, yields `None`.
    pub fn load(&self, path: &Path) -> Result<Option<CheckpointRecord>> {
        load_from(path, &self.ctx)
    }

    pub fn load_best(&self) -> Result<Option<CheckpointRecord>> {
        self.load(&self.best_path())
    }

    fn record_file_name(&self, serial: usize) -> String {
        format!("{}_{}-{}.{}", self.stem, self.tag, serial, self.extension)
    }

    fn rotate(&self) -> Result<()> {
        let mut serials = self.list()?;
        while serials.len() > self.max_keep {
            let victim = self.record_path(serials.remove(0));
            fs::remove_file(&victim).map_err(|err| {
                TrainingError::checkpoint(format!(
                    "failed to prune checkpoint {}: {err}",
                    victim.display()
                ))
            })?;
            self.ctx
                .logger()
                .debug(format!("pruned checkpoint {}", victim.display()));
        }
        Ok(())
    }
}

/// Store-independent loading, used when only a path is known.
pub fn load_from(path: &Path, ctx: &RunContext) -> Result<Option<CheckpointRecord>> {
    if !path.is_file() {
        return Ok(None);
    }
    let record = match read_json::<StoredFile>(path)? {
        StoredFile::Record(record) => *record,
        StoredFile::Pointer(pointer) => match resolve_pointer(path, pointer) {
            BestResolution::Present { path: target, .. } => match read_json::<StoredFile>(&target)? {
                StoredFile::Record(record) => *record,
                StoredFile::Pointer(_) => {
                    return Err(TrainingError::checkpoint(format!(
                        "best pointer {} refers to another pointer",
                        path.display()
                    )))
                }
            },
            BestResolution::Dangling { serial, path: target } => {
                ctx.logger().error(format!(
                    "best checkpoint (serial {serial}) was pruned, {} no longer exists",
                    target.display()
                ));
                return Ok(None);
            }
            BestResolution::Missing => return Ok(None),
        },
    };
    ensure_version_supported(record.version)?;
    Ok(Some(record))
}

fn resolve_pointer(pointer_path: &Path, pointer: BestPointer) -> BestResolution {
    let target = pointer_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&pointer.file);
    if target.is_file() {
        BestResolution::Present {
            serial: pointer.serial,
            path: target,
        }
    } else {
        BestResolution::Dangling {
            serial: pointer.serial,
            path: target,
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn ensure_version_supported(version: u32) -> Result<()> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

/// Writes next to the destination and renames into place, so a reader sees
/// either the previous file or the complete new one.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let data = serde_json::to_vec(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    let mut file = File::create(&tmp).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", tmp.display()))
    })?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", tmp.display()))
        })?;
    drop(file);

    fs::rename(&tmp, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move {} into place: {err}",
            path.display()
        ))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse {}: {err}", path.display()))
    })
}
