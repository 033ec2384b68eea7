//! Concurrent keyed table of lighting programs with file persistence.
//!
//! The store is a cheap-to-clone handle around a shared table. Readers
//! run concurrently and each mutation takes the write lock on its own.
//! Nothing is written to disk unless [`ProgramStore::save`] is called.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::program::Program;
use crate::tracing::prelude::*;

/// Version tag written into every store file.
const FORMAT_VERSION: u32 = 1;

/// How [`ProgramStore::merge_from_file`] treats names already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Incoming entries replace existing ones.
    #[default]
    Overwrite,
    /// Existing entries win; colliding incoming entries are skipped.
    KeepExisting,
}

/// What a merge did, name by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub skipped: Vec<String>,
}

/// On-disk layout.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    format: u32,
    programs: BTreeMap<String, Program>,
}

/// Shared table mapping program names to programs.
#[derive(Clone, Default)]
pub struct ProgramStore {
    programs: Arc<RwLock<HashMap<String, Program>>>,
}

impl ProgramStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store populated from a file written by [`save`](Self::save).
    pub fn restore(path: impl AsRef<Path>) -> Result<Self> {
        let programs = read_file(path.as_ref())?;
        debug!(path = %path.as_ref().display(), count = programs.len(), "Restored store");
        Ok(Self {
            programs: Arc::new(RwLock::new(programs.into_iter().collect())),
        })
    }

    /// Insert only if the name is free.
    ///
    /// The check and the insert happen under one write lock, so two
    /// concurrent callers racing for the same name see exactly one success.
    pub fn insert_new(&self, name: impl Into<String>, program: Program) -> Result<()> {
        use std::collections::hash_map::Entry;

        let name = name.into();
        match self.programs.write().entry(name) {
            Entry::Occupied(entry) => Err(Error::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(program);
                Ok(())
            }
        }
    }

    /// Insert or replace.
    pub fn insert(&self, name: impl Into<String>, program: Program) {
        self.programs.write().insert(name.into(), program);
    }

    /// Remove a program. Removing a missing name is not an error.
    pub fn delete(&self, name: &str) {
        self.programs.write().remove(name);
    }

    pub fn lookup(&self, name: &str) -> Option<Program> {
        self.programs.read().get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.programs.read().contains_key(name)
    }

    /// All program names, in no particular order.
    pub fn list_names(&self) -> Vec<String> {
        self.programs.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.programs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.read().is_empty()
    }

    /// Write the whole table to `path`, replacing any existing file.
    ///
    /// The table is snapshotted under the read lock and serialized after
    /// it is released. The write is not crash-atomic.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = StoreFile {
            format: FORMAT_VERSION,
            programs: self
                .programs
                .read()
                .iter()
                .map(|(name, program)| (name.clone(), program.clone()))
                .collect(),
        };

        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &snapshot).map_err(std::io::Error::from)?;
        writer.flush()?;

        debug!(path = %path.display(), count = snapshot.programs.len(), "Saved store");
        Ok(())
    }

    /// Fold the programs from `path` into this store.
    ///
    /// Each entry is applied under its own write lock; concurrent readers
    /// may observe a partially merged table.
    pub fn merge_from_file(&self, path: impl AsRef<Path>, policy: MergePolicy) -> Result<MergeReport> {
        let path = path.as_ref();
        let incoming = read_file(path)?;
        let mut report = MergeReport::default();

        for (name, program) in incoming {
            let mut programs = self.programs.write();
            match (programs.contains_key(&name), policy) {
                (false, _) => {
                    programs.insert(name.clone(), program);
                    report.added.push(name);
                }
                (true, MergePolicy::Overwrite) => {
                    programs.insert(name.clone(), program);
                    report.replaced.push(name);
                }
                (true, MergePolicy::KeepExisting) => report.skipped.push(name),
            }
        }

        debug!(
            path = %path.display(),
            added = report.added.len(),
            replaced = report.replaced.len(),
            skipped = report.skipped.len(),
            "Merged store file"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ProgramStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> Result<BTreeMap<String, Program>> {
    let reader = BufReader::new(File::open(path)?);
    let file: StoreFile = serde_json::from_reader(reader).map_err(|source| {
        // serde_json reports read failures through its own error type
        if source.is_io() {
            Error::Io(source.into())
        } else {
            Error::CorruptFile {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(file.programs)
}
