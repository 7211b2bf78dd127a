use crate::error::{FilterError, Result};
use crate::filter::FileId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Allocates stable file ids for paths under a root
///
/// Ids start at 1 and are never reused, so an id seen in an earlier pass
/// always refers to the same path. Names are kept as `OsString` so paths
/// that are not valid UTF-8 come back byte-for-byte after a reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIdRegistry {
    /// Root directory the paths were discovered under
    root_path: OsString,

    /// Unique directory paths (deduplicated)
    directories: Vec<OsString>,

    /// Entry `i` holds (directory_id, filename) of file id `i + 1`
    files: Vec<(u32, OsString)>,

    #[serde(skip)]
    dir_lookup: FxHashMap<PathBuf, u32>,

    #[serde(skip)]
    file_lookup: FxHashMap<PathBuf, FileId>,
}

impl FileIdRegistry {
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path: root_path.into_os_string(),
            directories: Vec::new(),
            files: Vec::new(),
            dir_lookup: FxHashMap::default(),
            file_lookup: FxHashMap::default(),
        }
    }

    pub fn root_path(&self) -> &Path {
        Path::new(&self.root_path)
    }

    /// Return the id of `path`, allocating the next one if it is unknown
    pub fn id_for(&mut self, path: &Path) -> FileId {
        if let Some(&file_id) = self.file_lookup.get(path) {
            return file_id;
        }

        let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        let filename = path.file_name().map(OsString::from).unwrap_or_default();

        let dir_id = *self.dir_lookup.entry(dir.clone()).or_insert_with(|| {
            let id = self.directories.len() as u32;
            self.directories.push(dir.into_os_string());
            id
        });

        self.files.push((dir_id, filename));
        let file_id = self.files.len() as FileId;
        self.file_lookup.insert(path.to_path_buf(), file_id);
        file_id
    }

    /// Id of an already registered path
    pub fn lookup(&self, path: &Path) -> Option<FileId> {
        self.file_lookup.get(path).copied()
    }

    /// Path of a file id (reconstructs from directory + filename)
    pub fn path_of(&self, file_id: FileId) -> Option<PathBuf> {
        let idx = (file_id as usize).checked_sub(1)?;
        let (dir_id, filename) = self.files.get(idx)?;
        let dir = self.directories.get(*dir_id as usize)?;
        Some(Path::new(dir).join(filename))
    }

    /// Rebuild the lookup tables (call after deserialization)
    ///
    /// Fails when a file refers to a directory that does not exist.
    pub fn rebuild_lookup(&mut self) -> Result<()> {
        if let Some((idx, (dir_id, _))) = self
            .files
            .iter()
            .enumerate()
            .find(|(_, (dir_id, _))| *dir_id as usize >= self.directories.len())
        {
            return Err(FilterError::InvalidStateFormat(format!(
                "file id {} refers to unknown directory {}",
                idx + 1,
                dir_id
            )));
        }

        self.dir_lookup = self
            .directories
            .iter()
            .enumerate()
            .map(|(i, p)| (PathBuf::from(p), i as u32))
            .collect();

        let file_lookup = self.iter().map(|(id, path)| (path, id)).collect();
        self.file_lookup = file_lookup;
        Ok(())
    }

    /// Number of registered files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    /// Iterate over all registered files as (file_id, full_path) pairs
    pub fn iter(&self) -> impl Iterator<Item = (FileId, PathBuf)> + '_ {
        self.files
            .iter()
            .enumerate()
            .map(|(idx, (dir_id, filename))| {
                let dir = Path::new(&self.directories[*dir_id as usize]);
                (idx as FileId + 1, dir.join(filename))
            })
    }
}
