//! Capability-scoped filesystem helpers.
//!
//! Every path is split into a parent directory opened with ambient
//! authority and a file name resolved inside it, so relative paths behave
//! like the current directory they were given against.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// A filesystem operation failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{action} {path} failed: {message}")]
pub struct FsError {
    /// Operation attempted.
    pub action: &'static str,
    /// Path involved.
    pub path: Utf8PathBuf,
    /// Operating system error string.
    pub message: String,
}

impl FsError {
    fn new(action: &'static str, path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            action,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FsError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| FsError {
        action: "resolve",
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    Ok((parent, file_name))
}

fn open_dir(path: &Utf8Path) -> Result<Dir, FsError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| FsError::new("open", path, &err))
}

/// Creates `path` and its missing parents.
///
/// # Errors
///
/// Returns [`FsError`] when a component cannot be created.
pub fn create_dir_all(path: &Utf8Path) -> Result<(), FsError> {
    Dir::create_ambient_dir_all(path, ambient_authority())
        .map_err(|err| FsError::new("create directory", path, &err))
}

/// Removes `path` recursively; a missing path is not an error.
///
/// # Errors
///
/// Returns [`FsError`] when removal fails.
pub fn remove_dir_all(path: &Utf8Path) -> Result<(), FsError> {
    let (parent, name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FsError::new("open", parent, &err)),
    };
    match dir.remove_dir_all(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FsError::new("remove", path, &err)),
    }
}

/// Removes a single file; a missing file is not an error.
///
/// # Errors
///
/// Returns [`FsError`] when removal fails.
pub fn remove_file(path: &Utf8Path) -> Result<(), FsError> {
    let (parent, name) = split(path)?;
    match open_dir(parent)?.remove_file(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FsError::new("remove", path, &err)),
    }
}

/// Recreates `path` as an empty directory.
///
/// # Errors
///
/// Returns [`FsError`] when removal or creation fails.
pub fn reset_dir(path: &Utf8Path) -> Result<(), FsError> {
    remove_dir_all(path)?;
    create_dir_all(path)
}

/// Whether `path` exists.
///
/// # Errors
///
/// Returns [`FsError`] when the parent directory cannot be inspected.
pub fn exists(path: &Utf8Path) -> Result<bool, FsError> {
    let (parent, name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(name)
            .map_err(|err| FsError::new("inspect", path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FsError::new("open", parent, &err)),
    }
}

/// Reads a UTF-8 file.
///
/// # Errors
///
/// Returns [`FsError`] when the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FsError> {
    let (parent, name) = split(path)?;
    open_dir(parent)?
        .read_to_string(name)
        .map_err(|err| FsError::new("read", path, &err))
}

/// Writes `contents` to `path`, replacing any previous file.
///
/// # Errors
///
/// Returns [`FsError`] when the file cannot be written.
pub fn write(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<(), FsError> {
    let (parent, name) = split(path)?;
    open_dir(parent)?
        .write(name, contents)
        .map_err(|err| FsError::new("write", path, &err))
}

/// Creates (or truncates) `path`, creating missing parents.
///
/// # Errors
///
/// Returns [`FsError`] when the directory or file cannot be created.
pub fn create_file(path: &Utf8Path) -> Result<std::fs::File, FsError> {
    let (parent, name) = split(path)?;
    create_dir_all(parent)?;
    open_dir(parent)?
        .create(name)
        .map(cap_std::fs_utf8::File::into_std)
        .map_err(|err| FsError::new("create", path, &err))
}

/// Names of the entries directly inside `path`, sorted.
///
/// # Errors
///
/// Returns [`FsError`] when the directory cannot be listed.
pub fn list_dir(path: &Utf8Path) -> Result<Vec<String>, FsError> {
    let dir = open_dir(path)?;
    let entries = dir
        .entries()
        .map_err(|err| FsError::new("list", path, &err))?;
    let mut names = Vec::new();
    for entry in entries {
        let name = entry
            .and_then(|item| item.file_name())
            .map_err(|err| FsError::new("list", path, &err))?;
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Every regular file below `root`, as paths relative to `root`, sorted.
///
/// # Errors
///
/// Returns [`FsError`] when a directory cannot be listed.
pub fn walk_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, FsError> {
    let mut files = Vec::new();
    let mut pending = vec![Utf8PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let absolute = if relative.as_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(&relative)
        };
        let dir = open_dir(&absolute)?;
        let entries = dir
            .entries()
            .map_err(|err| FsError::new("list", &absolute, &err))?;
        for entry in entries {
            let item = entry.map_err(|err| FsError::new("list", &absolute, &err))?;
            let name = item
                .file_name()
                .map_err(|err| FsError::new("list", &absolute, &err))?;
            let file_type = item
                .file_type()
                .map_err(|err| FsError::new("inspect", &absolute.join(&name), &err))?;
            let child = relative.join(&name);
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}
