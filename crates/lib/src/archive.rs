//! Archive extraction.
//!
//! Supports `.tar`, `.tar.gz`/`.tgz`, `.tar.xz`/`.txz` and `.zip`. The
//! format is inferred from the filename suffix. Every entry path is
//! validated before anything is written so that a crafted archive cannot
//! escape the destination directory. The cancellation token is checked
//! between entries so a cancelled build stops mid-archive.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xz2::read::XzDecoder;

/// Errors that can occur during extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
  /// The filename suffix does not map to a known format.
  #[error("unsupported archive format: {0}")]
  UnsupportedFormat(String),

  /// An entry would escape the destination directory.
  #[error("archive entry escapes destination: {0}")]
  PathTraversal(String),

  /// The archive path is not valid UTF-8.
  #[error("invalid archive path: {0}")]
  InvalidPath(PathBuf),

  /// An entry inside the archive is malformed.
  #[error("malformed archive entry: {0}")]
  MalformedEntry(String),

  #[error("zip error: {0}")]
  Zip(#[from] zip::result::ZipError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("extraction cancelled")]
  Cancelled,
}

/// Extract an archive into `dest`, creating it if needed.
///
/// `strip_components` drops that many leading path components from every
/// entry, which is how single-top-directory release archives (e.g.
/// `go/...`, `node-v20.11.0-linux-x64/...`) are flattened into the
/// install directory.
pub fn unpack_archive(
  archive_path: &Path,
  dest: &Path,
  strip_components: usize,
  cancel: &CancellationToken,
) -> Result<(), ExtractError> {
  let name = archive_path
    .to_str()
    .ok_or_else(|| ExtractError::InvalidPath(archive_path.to_path_buf()))?;

  fs::create_dir_all(dest)?;

  if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    let file = File::open(archive_path)?;
    unpack_tar(GzDecoder::new(BufReader::new(file)), dest, strip_components, cancel)?;
  } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
    let file = File::open(archive_path)?;
    unpack_tar(XzDecoder::new(BufReader::new(file)), dest, strip_components, cancel)?;
  } else if name.ends_with(".tar") {
    let file = File::open(archive_path)?;
    unpack_tar(BufReader::new(file), dest, strip_components, cancel)?;
  } else if name.ends_with(".zip") {
    unpack_zip(archive_path, dest, strip_components, cancel)?;
  } else {
    return Err(ExtractError::UnsupportedFormat(name.to_string()));
  }

  info!(dest = %dest.display(), "unpacked archive");
  Ok(())
}

/// Validate and strip an entry path.
///
/// Returns `None` when the entry has nothing left after stripping (e.g.
/// the top-level directory itself). Rejects absolute paths and any `..`
/// component.
fn sanitize_entry_path(path: &Path, strip_components: usize) -> Result<Option<PathBuf>, ExtractError> {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => out.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
        return Err(ExtractError::PathTraversal(path.display().to_string()));
      }
    }
  }

  let stripped: PathBuf = out.components().skip(strip_components).collect();
  if stripped.as_os_str().is_empty() {
    return Ok(None);
  }
  Ok(Some(stripped))
}

fn unpack_tar<R: std::io::Read>(
  reader: R,
  dest: &Path,
  strip_components: usize,
  cancel: &CancellationToken,
) -> Result<(), ExtractError> {
  let mut archive = Archive::new(reader);
  archive.set_preserve_permissions(true);

  for entry in archive.entries()? {
    if cancel.is_cancelled() {
      return Err(ExtractError::Cancelled);
    }
    let mut entry = entry?;
    let raw_path = entry.path()?.into_owned();

    let Some(rel) = sanitize_entry_path(&raw_path, strip_components)? else {
      continue;
    };

    let dest_path = dest.join(&rel);
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }

    // tar handles regular files, directories, symlinks and modes itself.
    entry.unpack(&dest_path)?;
    debug!(path = %dest_path.display(), "extracted entry");
  }

  Ok(())
}

fn unpack_zip(
  archive_path: &Path,
  dest: &Path,
  strip_components: usize,
  cancel: &CancellationToken,
) -> Result<(), ExtractError> {
  let file = File::open(archive_path)?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

  for i in 0..archive.len() {
    if cancel.is_cancelled() {
      return Err(ExtractError::Cancelled);
    }
    let mut entry = archive.by_index(i)?;

    let raw_path = entry
      .enclosed_name()
      .ok_or_else(|| ExtractError::PathTraversal(entry.name().to_string()))?;

    let Some(rel) = sanitize_entry_path(&raw_path, strip_components)? else {
      continue;
    };

    let dest_path = dest.join(&rel);

    if entry.is_dir() {
      fs::create_dir_all(&dest_path)?;
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    if is_zip_symlink(entry.unix_mode()) {
      let mut target = String::new();
      std::io::Read::read_to_string(&mut entry, &mut target)?;
      if dest_path.exists() {
        fs::remove_file(&dest_path)?;
      }
      std::os::unix::fs::symlink(&target, &dest_path)?;
      continue;
    }

    let mut outfile = File::create(&dest_path)?;
    std::io::copy(&mut entry, &mut outfile)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = entry.unix_mode() {
        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))?;
      }
    }
  }

  Ok(())
}

#[cfg(unix)]
fn is_zip_symlink(unix_mode: Option<u32>) -> bool {
  const S_IFMT: u32 = 0o170000;
  const S_IFLNK: u32 = 0o120000;
  unix_mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK)
}
