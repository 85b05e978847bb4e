use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::DynamicImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Prefix for per-upload working directories. `clear_session` refuses to
/// delete anything that does not carry it.
pub const SESSION_PREFIX: &str = "input_images_";

/// Max edge of the gallery thumbnails shipped to the webview.
const THUMBNAIL_MAX: u32 = 320;

/// A per-upload working directory: `<staging root>/input_images_<timestamp>/`
/// with an `images/` subdirectory for the staged inputs and a `results/`
/// subdirectory the reconstruction process writes into.
#[derive(Debug, Clone)]
pub struct Session {
    pub dir: PathBuf,
    pub images_dir: PathBuf,
}

impl Session {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            images_dir: dir.join("images"),
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.join("results")
    }

    /// Sorted file names currently staged (the frame-filter dropdown).
    pub fn staged_file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&self.images_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Creates a fresh timestamp-named session directory. If the directory
/// somehow already exists it is removed first (stale leftovers from a
/// crashed run).
pub fn create_session(staging_root: &Path) -> Result<Session> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let dir = staging_root.join(format!("{SESSION_PREFIX}{timestamp}"));

    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to clear stale session dir {}", dir.display()))?;
    }
    let session = Session::from_dir(&dir);
    fs::create_dir_all(&session.images_dir)
        .with_context(|| format!("Failed to create session dir {}", dir.display()))?;

    Ok(session)
}

/// Copies the uploaded files into the session's `images/` directory under
/// their file names and returns the sorted list of staged paths. Uploads
/// sharing a file name overwrite each other; the last copy wins.
pub fn stage_files(session: &Session, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let start = Instant::now();
    let mut staged = Vec::with_capacity(files.len());

    for file in files {
        let Some(name) = file.file_name() else {
            warn!(path = %file.display(), "skipping upload without a file name");
            continue;
        };
        let dst = session.images_dir.join(name);
        fs::copy(file, &dst)
            .with_context(|| format!("Failed to copy {} into the session", file.display()))?;
        staged.push(dst);
    }

    staged.sort();
    info!(
        count = staged.len(),
        dir = %session.images_dir.display(),
        "files staged in {:.3}s",
        start.elapsed().as_secs_f64()
    );
    Ok(staged)
}

/// Removes a session directory tree. Only paths created by
/// [`create_session`] are accepted; anything else is refused.
pub fn clear_session(dir: &Path) -> Result<()> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if !name.starts_with(SESSION_PREFIX) {
        bail!("{} is not a session directory", dir.display());
    }
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove session dir {}", dir.display()))?;
    }
    Ok(())
}

/// One gallery tile: the staged path plus an inline thumbnail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryImage {
    pub path: String,
    pub preview: String,
}

/// Builds base64 thumbnails for the staged images in parallel. Files the
/// image decoder rejects are skipped rather than failing the whole upload.
pub fn gallery_previews(paths: &[PathBuf]) -> Vec<GalleryImage> {
    paths
        .par_iter()
        .filter_map(|path| {
            let img = match image::open(path) {
                Ok(img) => img,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable upload: {e}");
                    return None;
                }
            };
            let thumb = img.thumbnail(THUMBNAIL_MAX, THUMBNAIL_MAX);
            let preview = match jpeg_data_uri(&thumb) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(path = %path.display(), "failed to encode thumbnail: {e}");
                    return None;
                }
            };
            Some(GalleryImage {
                path: path.to_string_lossy().into_owned(),
                preview,
            })
        })
        .collect()
}

/// Encodes an image as a `data:image/jpeg` URI for the webview.
pub fn jpeg_data_uri(img: &DynamicImage) -> Result<String> {
    // JPEG has no alpha channel; flatten first.
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut bytes: Vec<u8> = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .context("Failed to encode JPEG preview")?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(&bytes)
    ))
}

/// Encodes an image as a lossless `data:image/png` URI (used for the
/// before/after comparison where compression artifacts would lie).
pub fn png_data_uri(img: &DynamicImage) -> Result<String> {
    let mut bytes: Vec<u8> = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("Failed to encode PNG preview")?;
    Ok(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(&bytes)
    ))
}
