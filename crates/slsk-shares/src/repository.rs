//! Share repositories: the content store behind one host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::err::ShareError;
use crate::filter::SearchFilter;

/// Audio properties of a shared file, as far as they are known.
///
/// These feed the filter language's numeric thresholds and flags; a file
/// whose property is unknown fails any threshold on that property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct FileProperties {
    /// Bitrate in kbps, if known.
    pub bitrate: Option<u32>,
    /// Bit depth, if known.  Lossless formats carry one; lossy do not.
    pub bit_depth: Option<u32>,
    /// Sample rate in Hz, if known.
    pub sample_rate: Option<u32>,
    /// Track length in seconds, if known.
    pub length: Option<u32>,
    /// Whether the encoding is variable-bitrate.  `None` for formats
    /// where the distinction does not apply.
    pub is_variable_bit_rate: Option<bool>,
}

impl FileProperties {
    /// Return true if the file is losslessly encoded.
    ///
    /// A file is considered lossless when it carries a bit depth.
    pub fn is_lossless(&self) -> bool {
        self.bit_depth.is_some()
    }
}

/// One file visible to peers: its virtual path, size, and properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct SharedFile {
    /// The full virtual path, backslash separated, starting with the
    /// alias of the share that contains the file.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Audio properties.
    pub properties: FileProperties,
}

/// One shared root contributed by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct Share {
    /// The alias under which the root is advertised; the first component
    /// of every virtual path inside it.
    pub alias: String,
}

/// The content store behind one host.
///
/// For the local host, a repository is the product of a filesystem scan;
/// for a remote host, it is reconstituted from a dump uploaded by the
/// agent.  Either way, the index only ever consults it through this
/// trait.
pub trait ShareRepository: Send + Sync {
    /// Return files whose paths match the filter's term semantics, in a
    /// deterministic order, at most `limit` of them.
    fn search(&self, filter: &SearchFilter, limit: usize) -> Vec<SharedFile>;

    /// Map a virtual path to the real path behind it, if this repository
    /// contains the file.
    ///
    /// For remote repositories the "real" path is the path on the agent's
    /// filesystem; it is meaningful to the agent, not to us.
    fn resolve(&self, virtual_path: &str) -> Option<String>;

    /// Number of files in the repository.
    fn file_count(&self) -> usize;

    /// Number of distinct directories in the repository.
    fn directory_count(&self) -> usize;

    /// Check the repository's contents for internal consistency.
    ///
    /// Called before a repository is installed into the index, in
    /// particular for repositories received from relay agents.
    fn try_validate(&self) -> Result<(), ShareError>;
}

/// One file entry inside a [`MemoryRepository`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RepositoryFile {
    /// The advertised file.
    file: SharedFile,
    /// The real path behind it.
    real_path: String,
}

/// The serialized form of a [`MemoryRepository`].
///
/// Agents upload their shares in this shape; the controller
/// reconstitutes a repository from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RepositoryDump {
    /// The share roots.
    shares: Vec<Share>,
    /// Every file, in advertisement order.
    files: Vec<RepositoryFile>,
}

/// An in-memory [`ShareRepository`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    /// The share roots.
    shares: Vec<Share>,
    /// Every file, in insertion order.  Search results preserve this
    /// order, which makes searches deterministic for a fixed snapshot.
    files: Vec<RepositoryFile>,
    /// Index from virtual path to position in `files`.
    by_virtual: HashMap<String, usize>,
}

impl MemoryRepository {
    /// Construct an empty repository advertising the given share roots.
    pub fn new(shares: Vec<Share>) -> Self {
        MemoryRepository {
            shares,
            files: Vec::new(),
            by_virtual: HashMap::new(),
        }
    }

    /// Add one file.  A file with the same virtual path replaces the
    /// earlier entry in place, keeping its position.
    pub fn insert(&mut self, file: SharedFile, real_path: impl Into<String>) {
        let real_path = real_path.into();
        match self.by_virtual.get(&file.filename) {
            Some(&idx) => {
                self.files[idx] = RepositoryFile { file, real_path };
            }
            None => {
                self.by_virtual
                    .insert(file.filename.clone(), self.files.len());
                self.files.push(RepositoryFile { file, real_path });
            }
        }
    }

    /// Reconstitute a repository from a serialized dump.
    pub fn from_dump_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        let dump: RepositoryDump = serde_json::from_slice(bytes)
            .map_err(|e| ShareError::MalformedDump(std::sync::Arc::new(e)))?;
        let mut repo = MemoryRepository::new(dump.shares);
        for entry in dump.files {
            repo.insert(entry.file, entry.real_path);
        }
        Ok(repo)
    }

    /// Serialize this repository for transfer to a controller.
    pub fn to_dump_bytes(&self) -> Result<Vec<u8>, ShareError> {
        let dump = RepositoryDump {
            shares: self.shares.clone(),
            files: self.files.clone(),
        };
        serde_json::to_vec(&dump).map_err(|e| ShareError::MalformedDump(std::sync::Arc::new(e)))
    }

    /// The share roots this repository advertises.
    pub fn shares(&self) -> &[Share] {
        &self.shares
    }
}

/// Return the directory component of a virtual path.
fn folder_of(path: &str) -> &str {
    match path.rfind(['\\', '/']) {
        Some(idx) => &path[..idx],
        None => "",
    }
}

impl ShareRepository for MemoryRepository {
    fn search(&self, filter: &SearchFilter, limit: usize) -> Vec<SharedFile> {
        self.files
            .iter()
            .filter(|e| filter.matches_terms(&e.file.filename))
            .take(limit)
            .map(|e| e.file.clone())
            .collect()
    }

    fn resolve(&self, virtual_path: &str) -> Option<String> {
        self.by_virtual
            .get(virtual_path)
            .map(|&idx| self.files[idx].real_path.clone())
    }

    fn file_count(&self) -> usize {
        self.files.len()
    }

    fn directory_count(&self) -> usize {
        self.files
            .iter()
            .map(|e| folder_of(&e.file.filename))
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    fn try_validate(&self) -> Result<(), ShareError> {
        if self.shares.is_empty() {
            return Err(ShareError::Validation {
                reason: "repository advertises no share roots".into(),
            });
        }
        if self.shares.iter().any(|s| s.alias.trim().is_empty()) {
            return Err(ShareError::Validation {
                reason: "share root with empty alias".into(),
            });
        }
        for entry in &self.files {
            let filename = &entry.file.filename;
            let claimed = self.shares.iter().any(|s| {
                filename
                    .strip_prefix(s.alias.as_str())
                    .map_or(false, |rest| rest.starts_with(['\\', '/']))
            });
            if !claimed {
                return Err(ShareError::Validation {
                    reason: format!("file {filename:?} is outside every share root"),
                });
            }
        }
        Ok(())
    }
}
