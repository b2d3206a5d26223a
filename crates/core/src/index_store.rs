use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::error::{Result, SweepError};
use crate::index::IndexEntry;

pub const STORE_FORMAT_VERSION: u32 = 1;
const ENTRIES_FILE: &str = "entries.json";
const FILTER_FILE: &str = "filter.json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    /// blake3 of the serialized payload, hex encoded.
    digest: String,
    payload: T,
}

/// The two backing files of one index instance.
#[derive(Debug, Clone)]
pub struct IndexStore {
    directory: PathBuf,
}

#[derive(Debug)]
pub struct StoredIndex {
    pub entries: Vec<IndexEntry>,
    pub filter: BloomFilter,
}

impl IndexStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn entries_path(&self) -> PathBuf {
        self.directory.join(ENTRIES_FILE)
    }

    pub fn filter_path(&self) -> PathBuf {
        self.directory.join(FILTER_FILE)
    }

    /// `None` when nothing was ever saved. A partial or damaged pair is
    /// reported as `IndexCorruption`.
    pub fn load(&self) -> Result<Option<StoredIndex>> {
        let entries_path = self.entries_path();
        let filter_path = self.filter_path();
        match (entries_path.exists(), filter_path.exists()) {
            (false, false) => return Ok(None),
            (true, true) => {}
            _ => {
                return Err(SweepError::IndexCorruption(format!(
                    "index store under {} is missing one of its files",
                    self.directory.display()
                )))
            }
        }

        let entries: Vec<IndexEntry> = read_envelope(&entries_path)?;
        let filter: BloomFilter = read_envelope(&filter_path)?;
        filter.check_shape()?;
        debug!(
            entries = entries.len(),
            directory = %self.directory.display(),
            "loaded index store"
        );
        Ok(Some(StoredIndex { entries, filter }))
    }

    pub fn save(&self, entries: &[IndexEntry], filter: &BloomFilter) -> Result<()> {
        fs::create_dir_all(&self.directory).map_err(|err| SweepError::io(&self.directory, err))?;
        write_envelope(&self.entries_path(), entries)?;
        write_envelope(&self.filter_path(), filter)
    }

    /// Delete both files; used after a failed load.
    pub fn discard(&self) -> Result<()> {
        for path in [self.entries_path(), self.filter_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(SweepError::io(&path, err)),
            }
        }
        Ok(())
    }
}

fn digest_of<T: Serialize + ?Sized>(payload: &T, path: &Path) -> Result<String> {
    let bytes = serde_json::to_vec(payload).map_err(|err| {
        SweepError::Internal(format!("failed to encode {}: {err}", path.display()))
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn write_envelope<T: Serialize + ?Sized>(path: &Path, payload: &T) -> Result<()> {
    let envelope = Envelope {
        version: STORE_FORMAT_VERSION,
        digest: digest_of(payload, path)?,
        payload,
    };

    let temp_path = path.with_extension("tmp");
    let file = {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        opts.open(&temp_path)
            .map_err(|err| SweepError::io(&temp_path, err))?
    };

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &envelope).map_err(|err| {
        SweepError::Internal(format!("failed to write {}: {err}", temp_path.display()))
    })?;
    writer
        .flush()
        .map_err(|err| SweepError::io(&temp_path, err))?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|err| SweepError::io(path, err))
}

fn read_envelope<T: Serialize + DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|err| SweepError::io(path, err))?;
    let envelope: Envelope<T> = serde_json::from_slice(&data).map_err(|err| {
        SweepError::IndexCorruption(format!("{} is not a valid index file: {err}", path.display()))
    })?;

    if envelope.version != STORE_FORMAT_VERSION {
        return Err(SweepError::IndexCorruption(format!(
            "{} has format version {} (expected {STORE_FORMAT_VERSION})",
            path.display(),
            envelope.version
        )));
    }
    if digest_of(&envelope.payload, path)? != envelope.digest {
        return Err(SweepError::IndexCorruption(format!(
            "{} failed its integrity check",
            path.display()
        )));
    }
    Ok(envelope.payload)
}
