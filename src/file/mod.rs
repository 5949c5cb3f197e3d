pub mod error;
pub mod utils;

use std::path::{Component, Path, PathBuf};

use error::RequestPathError;

/// Prefix the client puts in front of the requested name when saving it.
pub const OUTPUT_PREFIX: &str = "recreated_";

#[derive(Debug)]
pub struct FileMetadata {
    // File name without directories, for display purposes.
    name: String,
    /// Size of the file in bytes
    size: u64,
    /// SHA-256 hash of the file content
    hash: [u8; 32],
}

impl FileMetadata {
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unnamed_file")
            .to_string();

        let filesize = std::fs::metadata(path)?.len();
        let filehash = utils::get_file_sha256_hash(path)?;

        Ok(Self {
            name: filename,
            size: filesize,
            hash: filehash,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Lowercase hex rendering of the SHA-256 digest, for logs.
    pub fn hash_hex(&self) -> String {
        utils::to_hex(&self.hash)
    }
}

/// Maps a file name received in a GET onto `root`.
///
/// Only plain relative names are accepted; `..`, absolute paths and drive
/// prefixes are rejected so a peer can never read outside `root`.
pub fn resolve_requested_path(root: &Path, name: &str) -> Result<PathBuf, RequestPathError> {
    if name.is_empty() {
        return Err(RequestPathError::Empty);
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RequestPathError::EscapesRoot(name.to_string()));
            }
        }
    }

    if resolved == root {
        return Err(RequestPathError::Empty);
    }
    Ok(resolved)
}

/// Where the client writes a downloaded file when no output path is given.
pub fn default_output_path(requested: &str) -> PathBuf {
    let base = Path::new(requested)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");
    PathBuf::from(format!("{OUTPUT_PREFIX}{base}"))
}
