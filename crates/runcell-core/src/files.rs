//! File set transferred into and out of an execution environment.
//!
//! A [`Files`] map is keyed by a path relative to the working directory.
//! Content is either UTF-8 text or raw bytes carried as base64, so a file
//! set can cross process and API boundaries as plain JSON.

use crate::error::EnvError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Mapping from relative path to content.
pub type Files = BTreeMap<String, FileContent>;

/// Content of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "content", rename_all = "lowercase")]
pub enum FileContent {
    /// UTF-8 text, written verbatim.
    Text(String),
    /// Raw bytes, base64-encoded (standard alphabet, padded).
    Base64(String),
}

impl FileContent {
    /// Classify raw bytes: valid UTF-8 becomes text, anything else base64.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Base64(STANDARD.encode(e.as_bytes())),
        }
    }

    /// Encode arbitrary bytes as base64 content regardless of their encoding.
    pub fn binary(bytes: impl AsRef<[u8]>) -> Self {
        Self::Base64(STANDARD.encode(bytes))
    }

    /// Bytes to write on disk.
    pub fn decode(&self) -> Result<Cow<'_, [u8]>, base64::DecodeError> {
        match self {
            Self::Text(text) => Ok(Cow::Borrowed(text.as_bytes())),
            Self::Base64(encoded) => STANDARD.decode(encoded).map(Cow::Owned),
        }
    }

    /// Text content, if this is a text file.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Base64(_) => None,
        }
    }

    /// True if the content is carried as base64.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Base64(_))
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Resolve `relative` against `root` without touching the filesystem.
///
/// `.` segments are dropped and `..` segments pop the previous one. The
/// result must be a strict descendant of `root`: absolute paths, empty
/// paths, paths that climb above the root and paths that collapse to the
/// root itself are rejected.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, EnvError> {
    let reject = || EnvError::PathSecurity {
        path: relative.to_string(),
        root: root.to_path_buf(),
    };

    let mut resolved = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(reject());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(reject()),
        }
    }

    if resolved.as_os_str().is_empty() {
        return Err(reject());
    }
    Ok(root.join(resolved))
}

/// Relative key for `path` under `root`, always with `/` separators.
///
/// `None` if `path` is not below `root` or any component is not UTF-8.
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
