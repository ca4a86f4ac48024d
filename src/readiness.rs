use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Written last by the estimator; its presence means the lot is analysed.
pub const TERMINAL_MARKER: &str = "repair_estimate.txt";
pub const REPAIR_DETAILS_FILE: &str = "repair_details.txt";
pub const RESALE_FILE: &str = "resale_estimate.txt";
pub const EVALUATION_FILE: &str = "flip_evaluation.txt";

/// Idempotency gate over a lot's local directory. No network, no store.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    min_images: usize,
}

impl Default for Readiness {
    fn default() -> Self {
        Self { min_images: 5 }
    }
}

impl Readiness {
    pub fn new(min_images: usize) -> Self {
        Self {
            min_images: min_images.max(1),
        }
    }

    pub fn needs_download(&self, lot_dir: &Path) -> bool {
        count_images(lot_dir) < self.min_images
    }

    pub fn needs_analysis(&self, lot_dir: &Path) -> bool {
        !lot_dir.join(TERMINAL_MARKER).is_file()
    }
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}

pub fn count_images(lot_dir: &Path) -> usize {
    list_images(lot_dir, usize::MAX).map(|v| v.len()).unwrap_or(0)
}

/// Accepted image files directly inside `lot_dir`, ordered by file name.
pub fn list_images(lot_dir: &Path, max: usize) -> io::Result<Vec<PathBuf>> {
    let mut images = fs::read_dir(lot_dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| is_image(path))
        .collect::<Vec<_>>();
    images.sort();
    images.truncate(max);
    Ok(images)
}

/// Immediate subdirectories of the download root, ordered by name.
pub fn lot_directories(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = fs::read_dir(root)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}
