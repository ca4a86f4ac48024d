use crate::readiness::is_image;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use zip::{ZipArchive, result::ZipError};

const STAGING_DIR: &str = ".extracting";
/// Browser temp suffixes for downloads that are still being written.
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no archive appeared in {dir} within {timeout:?}")]
    NotCaptured { dir: String, timeout: Duration },
    #[error("archive {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("archive {path} contained no images")]
    Empty { path: String },
    #[error("archive io failed: {0}")]
    Io(#[from] io::Error),
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            PARTIAL_SUFFIXES
                .iter()
                .any(|suffix| ext.eq_ignore_ascii_case(suffix))
        })
        .unwrap_or(false)
}

struct DirScan {
    archive: Option<(PathBuf, u64)>,
    partial: bool,
}

fn scan(dir: &Path) -> io::Result<DirScan> {
    let mut archive: Option<(PathBuf, u64)> = None;
    let mut partial = false;
    for entry in fs::read_dir(dir)?.filter_map(Result::ok) {
        let path = entry.path();
        if is_partial(&path) {
            partial = true;
        } else if is_archive(&path) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if archive.as_ref().is_none_or(|(current, _)| path < *current) {
                archive = Some((path, size));
            }
        }
    }
    Ok(DirScan { archive, partial })
}

/// Removes archives, partial downloads and staging left in `dir` by an
/// earlier session that died mid-download. Returns how many entries went.
pub fn clear_leftovers(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)?.filter_map(Result::ok) {
        let path = entry.path();
        if path.file_name().is_some_and(|name| name == STAGING_DIR) {
            fs::remove_dir_all(&path)?;
            removed += 1;
        } else if path.is_file() && (is_archive(&path) || is_partial(&path)) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(target = "scout.archive", dir = %dir.display(), removed, "stale_downloads_cleared");
    }
    Ok(removed)
}

/// Waits for the browser to finish writing an archive into `dir`.
///
/// Finished means: a `.zip` exists, no partial download sits beside it, and
/// its size did not change between two consecutive polls.
pub async fn await_archive(
    dir: &Path,
    timeout: Duration,
    poll: Duration,
) -> Result<PathBuf, ArchiveError> {
    let deadline = Instant::now() + timeout;
    let mut last_seen: Option<(PathBuf, u64)> = None;
    loop {
        let state = scan(dir)?;
        match (state.archive, state.partial) {
            (Some(current), false) if current.1 > 0 && last_seen.as_ref() == Some(&current) => {
                debug!(target = "scout.archive", path = %current.0.display(), bytes = current.1, "archive_captured");
                return Ok(current.0);
            }
            (seen, _) => last_seen = seen,
        }
        if Instant::now() >= deadline {
            return Err(ArchiveError::NotCaptured {
                dir: dir.display().to_string(),
                timeout,
            });
        }
        sleep(poll).await;
    }
}

/// Extracts the archive's images into `lot_dir` and deletes the archive.
///
/// Entries are unpacked into a staging directory first so a corrupt archive
/// never leaves a partial image set behind. Returns the number of images moved.
pub fn extract_in_place(archive: &Path, lot_dir: &Path) -> Result<usize, ArchiveError> {
    let staging = lot_dir.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let staged = match unpack(archive, &staging) {
        Ok(staged) => staged,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            if matches!(err, ArchiveError::Corrupt { .. }) {
                // Leave the lot image-free so the next run downloads it again.
                let _ = fs::remove_file(archive);
            }
            return Err(err);
        }
    };

    let mut moved = 0;
    for path in staged {
        let Some(name) = path.file_name() else {
            continue;
        };
        fs::rename(&path, free_path(lot_dir, Path::new(name)))?;
        moved += 1;
    }
    fs::remove_dir_all(&staging)?;

    if moved == 0 {
        let _ = fs::remove_file(archive);
        return Err(ArchiveError::Empty {
            path: archive.display().to_string(),
        });
    }
    fs::remove_file(archive)?;
    info!(target = "scout.archive", path = %archive.display(), images = moved, "archive_extracted");
    Ok(moved)
}

/// `dir/name`, or `dir/<n>_name` with the first free `n` when flattening
/// nested folders makes two entries share a file name.
fn free_path(dir: &Path, name: &Path) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{n:02}_{}", name.display())))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn unpack(archive: &Path, staging: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let corrupt = |reason: String| ArchiveError::Corrupt {
        path: archive.display().to_string(),
        reason,
    };
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|err| match err {
        ZipError::Io(io) => ArchiveError::Io(io),
        other => corrupt(other.to_string()),
    })?;

    let mut staged = Vec::new();
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx).map_err(|err| corrupt(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        // Flatten nested folders and refuse paths that escape the staging dir.
        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(PathBuf::from))
        else {
            warn!(target = "scout.archive", entry = entry.name(), "archive_entry_skipped");
            continue;
        };
        if !is_image(&name) {
            continue;
        }
        let target = free_path(staging, &name);
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|err| match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => corrupt(err.to_string()),
            _ => ArchiveError::Io(err),
        })?;
        staged.push(target);
    }
    Ok(staged)
}
