use ndarray::ArrayD;
use ndarray_npy::{NpzReader, ReadNpzError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Predictions file not found at {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to open predictions archive {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read predictions archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: ReadNpzError,
    },
    #[error("predictions archive has no '{0}' array")]
    MissingKey(&'static str),
    #[error("'{key}' array has unexpected shape {shape:?}")]
    BadShape { key: &'static str, shape: Vec<usize> },
}

/// Which branch of the reconstruction output supplies the displayed points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    /// Points the external process derived from its depth maps and camera
    /// poses.
    #[default]
    DepthmapAndCamera,
    /// The directly regressed world-point map.
    Pointmap,
}

impl PredictionMode {
    /// Stable token used in scene cache file names.
    pub fn token(&self) -> &'static str {
        match self {
            PredictionMode::DepthmapAndCamera => "depth_cam",
            PredictionMode::Pointmap => "pointmap",
        }
    }
}

/// Arrays loaded from `predictions.npz`, keyed by the names the external
/// reconstruction process writes. Every array is optional in the archive;
/// unknown extra entries are ignored.
#[derive(Debug, Default)]
pub struct PredictionSet {
    pub pose_enc: Option<ArrayD<f32>>,
    pub depth: Option<ArrayD<f32>>,
    pub depth_conf: Option<ArrayD<f32>>,
    pub world_points: Option<ArrayD<f32>>,
    pub world_points_conf: Option<ArrayD<f32>>,
    pub images: Option<ArrayD<f32>>,
    pub extrinsic: Option<ArrayD<f32>>,
    pub intrinsic: Option<ArrayD<f32>>,
    pub world_points_from_depth: Option<ArrayD<f32>>,
}

/// Points plus their confidence for one prediction branch. A missing
/// confidence array means every point counts as fully confident.
#[derive(Debug)]
pub struct PointSelection<'a> {
    pub key: &'static str,
    pub conf_key: &'static str,
    pub points: &'a ArrayD<f32>,
    pub conf: Option<&'a ArrayD<f32>>,
}

impl PredictionSet {
    /// Loads the multi-array result file written by the reconstruction
    /// process. Entry names may or may not carry the `.npy` suffix inside
    /// the zip; both spellings are accepted.
    pub fn load(path: &Path) -> Result<Self, PredictionError> {
        if !path.is_file() {
            return Err(PredictionError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let file = File::open(path).map_err(|source| PredictionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut npz = NpzReader::new(file).map_err(|source| archive_err(path, source))?;
        let names = npz.names().map_err(|source| archive_err(path, source))?;

        let mut set = PredictionSet::default();
        for name in &names {
            let key = name.strip_suffix(".npy").unwrap_or(name);
            let slot = match key {
                "pose_enc" => &mut set.pose_enc,
                "depth" => &mut set.depth,
                "depth_conf" => &mut set.depth_conf,
                "world_points" => &mut set.world_points,
                "world_points_conf" => &mut set.world_points_conf,
                "images" => &mut set.images,
                "extrinsic" => &mut set.extrinsic,
                "intrinsic" => &mut set.intrinsic,
                "world_points_from_depth" => &mut set.world_points_from_depth,
                _ => {
                    debug!(key, "ignoring unknown array in predictions archive");
                    continue;
                }
            };
            *slot = Some(read_f32(&mut npz, name).map_err(|source| archive_err(path, source))?);
        }

        Ok(set)
    }

    /// Color frames normalized to NHWC with 0-1 float channels. The archive
    /// may store them NCHW; a 4-d array with 3 in the channel-first slot is
    /// treated as such.
    pub fn color_frames(&self) -> Result<ndarray::ArrayViewD<'_, f32>, PredictionError> {
        let images = self
            .images
            .as_ref()
            .ok_or(PredictionError::MissingKey("images"))?;
        let view = images.view();
        if images.ndim() == 4 && images.shape()[1] == 3 {
            return Ok(view.permuted_axes(vec![0, 2, 3, 1]));
        }
        Ok(view)
    }

    /// Picks the point/confidence arrays for a prediction mode. Archives
    /// without the pointmap branch fall back to the depth-derived points.
    pub fn select(&self, mode: PredictionMode) -> Result<PointSelection<'_>, PredictionError> {
        if mode == PredictionMode::Pointmap {
            if let Some(points) = &self.world_points {
                return Ok(PointSelection {
                    key: "world_points",
                    conf_key: "world_points_conf",
                    points,
                    conf: self.world_points_conf.as_ref(),
                });
            }
        }

        let points = self
            .world_points_from_depth
            .as_ref()
            .ok_or(PredictionError::MissingKey("world_points_from_depth"))?;
        Ok(PointSelection {
            key: "world_points_from_depth",
            conf_key: "depth_conf",
            points,
            conf: self.depth_conf.as_ref(),
        })
    }
}

fn archive_err(path: &Path, source: ReadNpzError) -> PredictionError {
    PredictionError::Archive {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads one entry as f32, converting from f64 when the archive was written
/// through numpy's default float promotion.
fn read_f32(npz: &mut NpzReader<File>, entry: &str) -> Result<ArrayD<f32>, ReadNpzError> {
    match npz.by_name::<ndarray::OwnedRepr<f32>, ndarray::IxDyn>(entry) {
        Ok(array) => Ok(array),
        Err(first) => match npz.by_name::<ndarray::OwnedRepr<f64>, ndarray::IxDyn>(entry) {
            Ok(array) => Ok(array.mapv(|v| v as f32)),
            Err(_) => Err(first),
        },
    }
}
