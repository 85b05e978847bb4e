use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::glb::{self, VertexSet};
use crate::predictions::{PredictionError, PredictionMode, PredictionSet};

/// Viewer parameters for one rendered scene. Every field feeds the cache
/// file name, so flipping a control back to an earlier combination reuses
/// the file written for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneParams {
    /// Confidence percentile cutoff, 0-100. Zero keeps every point.
    #[serde(default = "default_conf")]
    pub conf_percent: f32,
    /// `"All"`, or `"<index>: <file name>"` to show a single frame.
    #[serde(default = "default_frame_filter")]
    pub frame_filter: String,
    #[serde(default)]
    pub mask_black_bg: bool,
    #[serde(default)]
    pub mask_white_bg: bool,
    #[serde(default = "default_show_cameras")]
    pub show_cameras: bool,
    #[serde(default)]
    pub mode: PredictionMode,
}

fn default_conf() -> f32 {
    50.0
}

fn default_frame_filter() -> String {
    "All".to_string()
}

fn default_show_cameras() -> bool {
    true
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            conf_percent: default_conf(),
            frame_filter: default_frame_filter(),
            mask_black_bg: false,
            mask_white_bg: false,
            show_cameras: default_show_cameras(),
            mode: PredictionMode::default(),
        }
    }
}

impl SceneParams {
    /// Cache file name for this parameter combination, written into the
    /// session directory next to `results/`.
    pub fn glb_file_name(&self) -> String {
        let frame = self
            .frame_filter
            .replace('.', "_")
            .replace(':', "")
            .replace(' ', "_");
        format!(
            "glbscene_{}_{}_maskb{}_maskw{}_cam{}_{}.glb",
            self.conf_percent,
            frame,
            self.mask_black_bg,
            self.mask_white_bg,
            self.show_cameras,
            self.mode.token()
        )
    }
}

/// Parses the frame-filter dropdown value. `"All"`, or anything without a
/// leading index, means no filtering.
pub fn parse_frame_filter(filter: &str) -> Option<usize> {
    let (index, _) = filter.split_once(':')?;
    index.trim().parse().ok()
}

/// Dropdown choices for a staged file list: `"All"` first, then one
/// `"<index>: <name>"` entry per image.
pub fn frame_filter_choices(names: &[String]) -> Vec<String> {
    let mut choices = Vec::with_capacity(names.len() + 1);
    choices.push("All".to_string());
    choices.extend(names.iter().enumerate().map(|(i, name)| format!("{i}: {name}")));
    choices
}

/// A renderable scene: the filtered point cloud plus optional camera
/// wireframes, with the display-axis conversion already applied.
#[derive(Debug)]
pub struct BuiltScene {
    pub cloud: VertexSet,
    pub cameras: Option<VertexSet>,
    /// Points surviving the filters (the cloud holds a placeholder vertex
    /// when this is zero).
    pub kept_points: usize,
    pub total_points: usize,
}

/// Writes (or reuses) the GLB for a parameter combination. A previously
/// rendered combination is returned without rebuilding.
pub fn write_scene(
    session_dir: &Path,
    preds: &PredictionSet,
    params: &SceneParams,
) -> Result<PathBuf> {
    let glb_path = session_dir.join(params.glb_file_name());
    if glb_path.is_file() {
        debug!(path = %glb_path.display(), "reusing cached scene file");
        return Ok(glb_path);
    }

    let scene = build_scene(preds, params)?;
    debug!(
        kept = scene.kept_points,
        total = scene.total_points,
        "writing scene to {}",
        glb_path.display()
    );
    glb::write_glb(&glb_path, &scene.cloud, scene.cameras.as_ref())
        .with_context(|| format!("Failed to write scene file {}", glb_path.display()))?;
    Ok(glb_path)
}

/// Turns the loaded prediction arrays into GLB-ready vertex sets. Pure
/// array plumbing: points, colors, and camera poses are consumed exactly as
/// the reconstruction process wrote them.
pub fn build_scene(
    preds: &PredictionSet,
    params: &SceneParams,
) -> Result<BuiltScene, PredictionError> {
    let selection = preds.select(params.mode)?;
    let points = selection.points;
    let shape = points.shape();
    if shape.len() != 4 || shape[3] != 3 {
        return Err(PredictionError::BadShape {
            key: selection.key,
            shape: shape.to_vec(),
        });
    }
    let (frames, h, w) = (shape[0], shape[1], shape[2]);

    let colors = preds.color_frames()?;
    if colors.shape() != [frames, h, w, 3] {
        return Err(PredictionError::BadShape {
            key: "images",
            shape: colors.shape().to_vec(),
        });
    }
    if let Some(conf) = selection.conf {
        if conf.shape() != [frames, h, w] {
            return Err(PredictionError::BadShape {
                key: selection.conf_key,
                shape: conf.shape().to_vec(),
            });
        }
    }

    let frame_range: Vec<usize> = match parse_frame_filter(&params.frame_filter) {
        Some(i) if i < frames => vec![i],
        Some(i) => {
            warn!(frame = i, frames, "frame filter out of range, showing all frames");
            (0..frames).collect()
        }
        None => (0..frames).collect(),
    };

    // Percentile threshold over the selected frames' confidences. Zero
    // keeps everything; points with near-zero confidence are dropped
    // regardless.
    let threshold = match (params.conf_percent > 0.0, selection.conf) {
        (true, Some(conf)) => {
            let mut values: Vec<f32> = Vec::with_capacity(frame_range.len() * h * w);
            for &f in &frame_range {
                for y in 0..h {
                    for x in 0..w {
                        values.push(conf[[f, y, x]]);
                    }
                }
            }
            values.sort_by(f32::total_cmp);
            percentile(&values, params.conf_percent)
        }
        _ => 0.0,
    };

    let total_points = frame_range.len() * h * w;
    let mut cloud = VertexSet::default();
    for &f in &frame_range {
        for y in 0..h {
            for x in 0..w {
                let conf_value = selection.conf.map(|c| c[[f, y, x]]).unwrap_or(1.0);
                if !(conf_value >= threshold && conf_value > 1e-5) {
                    continue;
                }

                let r = (colors[[f, y, x, 0]] * 255.0) as u8;
                let g = (colors[[f, y, x, 1]] * 255.0) as u8;
                let b = (colors[[f, y, x, 2]] * 255.0) as u8;
                if params.mask_black_bg && (r as u16 + g as u16 + b as u16) < 16 {
                    continue;
                }
                if params.mask_white_bg && r > 240 && g > 240 && b > 240 {
                    continue;
                }

                let p = [
                    points[[f, y, x, 0]],
                    points[[f, y, x, 1]],
                    points[[f, y, x, 2]],
                ];
                // non-finite positions would poison the POSITION min/max
                if p.iter().any(|v| !v.is_finite()) {
                    continue;
                }
                cloud.push(flip_axes(p), [r, g, b, 255]);
            }
        }
    }

    let kept_points = cloud.positions.len();
    if kept_points == 0 {
        // an empty POSITION accessor is invalid glTF; ship a single white
        // marker instead
        cloud.push([1.0, 0.0, 0.0], [255, 255, 255, 255]);
    }

    let scale = scene_scale(&cloud.positions);
    let cameras = if params.show_cameras {
        build_camera_wires(preds, &frame_range, w, h, scale)
    } else {
        None
    };

    Ok(BuiltScene {
        cloud,
        cameras,
        kept_points,
        total_points,
    })
}

/// OpenCV camera space (+Y down, +Z forward) to the +Y-up convention GLB
/// viewers expect.
fn flip_axes(p: [f32; 3]) -> [f32; 3] {
    [p[0], -p[1], -p[2]]
}

/// Diagonal of the 5th..95th percentile bounding box; sizes the camera
/// markers relative to the cloud.
fn scene_scale(positions: &[[f32; 3]]) -> f32 {
    if positions.len() < 2 {
        return 1.0;
    }
    let mut diag_sq = 0.0f32;
    for axis in 0..3 {
        let mut values: Vec<f32> = positions.iter().map(|p| p[axis]).collect();
        values.sort_by(f32::total_cmp);
        let span = percentile(&values, 95.0) - percentile(&values, 5.0);
        diag_sq += span * span;
    }
    diag_sq.sqrt()
}

/// One wireframe frustum per selected frame, built from the ready-made
/// world-to-camera extrinsics: invert the pose, place the image-corner rays
/// at a fixed depth, connect them with lines.
fn build_camera_wires(
    preds: &PredictionSet,
    frame_range: &[usize],
    img_w: usize,
    img_h: usize,
    scale: f32,
) -> Option<VertexSet> {
    let extrinsic = preds.extrinsic.as_ref()?;
    let eshape = extrinsic.shape();
    if eshape.len() != 3 || eshape[1] != 3 || eshape[2] != 4 {
        warn!(shape = ?eshape, "extrinsic array has unexpected shape, skipping camera markers");
        return None;
    }

    let depth = if scale > 0.0 { scale * 0.1 } else { 0.1 };
    let count = frame_range.len();
    let mut wires = VertexSet::default();

    for (slot, &f) in frame_range.iter().enumerate() {
        if f >= eshape[0] {
            continue;
        }
        let rot = [
            [
                extrinsic[[f, 0, 0]],
                extrinsic[[f, 0, 1]],
                extrinsic[[f, 0, 2]],
            ],
            [
                extrinsic[[f, 1, 0]],
                extrinsic[[f, 1, 1]],
                extrinsic[[f, 1, 2]],
            ],
            [
                extrinsic[[f, 2, 0]],
                extrinsic[[f, 2, 1]],
                extrinsic[[f, 2, 2]],
            ],
        ];
        let trans = [
            extrinsic[[f, 0, 3]],
            extrinsic[[f, 1, 3]],
            extrinsic[[f, 2, 3]],
        ];
        let (fx, fy, cx, cy) = intrinsics_for(preds, f, img_w, img_h);

        // center + four image-corner rays, in camera space
        let corners = [(0.0f32, 0.0f32), (img_w as f32, 0.0), (img_w as f32, img_h as f32), (0.0, img_h as f32)];
        let mut pts = [[0.0f32; 3]; 5];
        for (i, (u, v)) in corners.iter().enumerate() {
            pts[i] = [(u - cx) / fx * depth, (v - cy) / fy * depth, depth];
        }
        // pts[4] stays the camera center
        for p in &mut pts {
            *p = flip_axes(cam_to_world(*p, &rot, &trans));
        }
        if pts.iter().any(|p| p.iter().any(|v| !v.is_finite())) {
            warn!(frame = f, "camera pose is not finite, skipping its marker");
            continue;
        }

        let color = rainbow_color(slot, count);
        let segments: [(usize, usize); 8] = [
            (4, 0),
            (4, 1),
            (4, 2),
            (4, 3),
            (0, 1),
            (1, 2),
            (2, 3),
            (3, 0),
        ];
        for (a, b) in segments {
            wires.push(pts[a], color);
            wires.push(pts[b], color);
        }
    }

    if wires.positions.is_empty() {
        None
    } else {
        Some(wires)
    }
}

/// Focal/principal values for a frame, with a plain symmetric fallback when
/// the archive carries no usable intrinsics.
fn intrinsics_for(preds: &PredictionSet, frame: usize, img_w: usize, img_h: usize) -> (f32, f32, f32, f32) {
    if let Some(k) = preds.intrinsic.as_ref() {
        let shape = k.shape();
        if shape.len() == 3 && shape[0] > frame && shape[1] == 3 && shape[2] == 3 {
            let (fx, fy) = (k[[frame, 0, 0]], k[[frame, 1, 1]]);
            if fx > 0.0 && fy > 0.0 && fx.is_finite() && fy.is_finite() {
                return (fx, fy, k[[frame, 0, 2]], k[[frame, 1, 2]]);
            }
        }
    }
    let f = 1.2 * img_w.max(img_h) as f32;
    (f, f, img_w as f32 / 2.0, img_h as f32 / 2.0)
}

/// Inverts the rigid world-to-camera pose: x_world = R^T (x_cam - t).
fn cam_to_world(p: [f32; 3], rot: &[[f32; 3]; 3], trans: &[f32; 3]) -> [f32; 3] {
    let d = [p[0] - trans[0], p[1] - trans[1], p[2] - trans[2]];
    [
        rot[0][0] * d[0] + rot[1][0] * d[1] + rot[2][0] * d[2],
        rot[0][1] * d[0] + rot[1][1] * d[1] + rot[2][1] * d[2],
        rot[0][2] * d[0] + rot[1][2] * d[1] + rot[2][2] * d[2],
    ]
}

/// Evenly spaced hues so each camera wireframe is distinguishable.
fn rainbow_color(index: usize, count: usize) -> [u8; 4] {
    let hue = if count <= 1 {
        0.0
    } else {
        300.0 * index as f32 / (count - 1) as f32
    };
    let x = 1.0 - ((hue / 60.0) % 2.0 - 1.0).abs();
    let (r, g, b) = match (hue / 60.0) as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8, 255]
}

/// Percentile with linear interpolation between ranks (what `np.percentile`
/// does by default), over an ascending-sorted slice.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let weight = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    // One frame, 2x2 grid: confidences 1..4, pixel 2 black, pixel 3 white.
    fn single_frame() -> PredictionSet {
        let points = Array::from_shape_vec(
            (1, 2, 2, 3),
            vec![
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0,
            ],
        )
        .unwrap()
        .into_dyn();
        let conf = Array::from_shape_vec((1, 2, 2), vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        let images = Array::from_shape_vec(
            (1, 2, 2, 3),
            vec![
                0.5, 0.5, 0.5, //
                0.2, 0.4, 0.6, //
                0.0, 0.0, 0.0, //
                1.0, 1.0, 1.0,
            ],
        )
        .unwrap()
        .into_dyn();
        let extrinsic = Array::from_shape_vec(
            (1, 3, 4),
            vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        )
        .unwrap()
        .into_dyn();
        let intrinsic = Array::from_shape_vec(
            (1, 3, 3),
            vec![2.0, 0.0, 1.0, 0.0, 2.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap()
        .into_dyn();

        PredictionSet {
            depth_conf: Some(conf),
            world_points_from_depth: Some(points),
            images: Some(images),
            extrinsic: Some(extrinsic),
            intrinsic: Some(intrinsic),
            ..Default::default()
        }
    }

    // Two frames of a single point each; frame 1 sits at z = 5.
    fn two_frames() -> PredictionSet {
        let points = Array::from_shape_vec((2, 1, 1, 3), vec![0.0, 0.0, 0.0, 0.0, 0.0, 5.0])
            .unwrap()
            .into_dyn();
        let conf = Array::from_shape_vec((2, 1, 1), vec![1.0, 1.0]).unwrap().into_dyn();
        let images = Array::from_shape_vec((2, 1, 1, 3), vec![0.5; 6]).unwrap().into_dyn();
        PredictionSet {
            depth_conf: Some(conf),
            world_points_from_depth: Some(points),
            images: Some(images),
            ..Default::default()
        }
    }

    fn keep_all_params() -> SceneParams {
        SceneParams {
            conf_percent: 0.0,
            show_cameras: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_keep_all_applies_axis_flip() {
        let scene = build_scene(&single_frame(), &keep_all_params()).unwrap();
        assert_eq!(scene.kept_points, 4);
        assert_eq!(scene.total_points, 4);
        assert_eq!(scene.cloud.positions[1], [1.0, 0.0, 0.0]);
        assert_eq!(scene.cloud.positions[2], [0.0, -1.0, 0.0]);
        assert_eq!(scene.cloud.positions[3], [0.0, 0.0, -1.0]);
        // 0.5 * 255 truncates to 127
        assert_eq!(scene.cloud.colors[0], [127, 127, 127, 255]);
    }

    #[test]
    fn test_confidence_percentile_threshold() {
        let params = SceneParams {
            conf_percent: 50.0,
            show_cameras: false,
            ..Default::default()
        };
        // percentile([1,2,3,4], 50) = 2.5, keeping confidences 3 and 4
        let scene = build_scene(&single_frame(), &params).unwrap();
        assert_eq!(scene.kept_points, 2);
    }

    #[test]
    fn test_zero_percent_still_drops_near_zero_confidence() {
        let mut preds = single_frame();
        let conf = Array::from_shape_vec((1, 2, 2), vec![0.0, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        preds.depth_conf = Some(conf);
        let scene = build_scene(&preds, &keep_all_params()).unwrap();
        assert_eq!(scene.kept_points, 3);
    }

    #[test]
    fn test_black_background_mask() {
        let params = SceneParams {
            mask_black_bg: true,
            ..keep_all_params()
        };
        let scene = build_scene(&single_frame(), &params).unwrap();
        assert_eq!(scene.kept_points, 3);
    }

    #[test]
    fn test_white_background_mask() {
        let params = SceneParams {
            mask_white_bg: true,
            ..keep_all_params()
        };
        let scene = build_scene(&single_frame(), &params).unwrap();
        assert_eq!(scene.kept_points, 3);
    }

    #[test]
    fn test_all_filtered_ships_placeholder_vertex() {
        let mut preds = single_frame();
        preds.depth_conf = Some(Array::from_elem((1, 2, 2), 0.0f32).into_dyn());
        let scene = build_scene(&preds, &keep_all_params()).unwrap();
        assert_eq!(scene.kept_points, 0);
        assert_eq!(scene.cloud.positions, vec![[1.0, 0.0, 0.0]]);
        assert_eq!(scene.cloud.colors, vec![[255, 255, 255, 255]]);
    }

    #[test]
    fn test_frame_filter_selects_one_block() {
        let params = SceneParams {
            frame_filter: "1: b.png".to_string(),
            ..keep_all_params()
        };
        let scene = build_scene(&two_frames(), &params).unwrap();
        assert_eq!(scene.kept_points, 1);
        assert_eq!(scene.cloud.positions[0], [0.0, 0.0, -5.0]);
    }

    #[test]
    fn test_out_of_range_frame_filter_shows_all() {
        let params = SceneParams {
            frame_filter: "7: nope.png".to_string(),
            ..keep_all_params()
        };
        let scene = build_scene(&two_frames(), &params).unwrap();
        assert_eq!(scene.kept_points, 2);
    }

    #[test]
    fn test_parse_frame_filter() {
        assert_eq!(parse_frame_filter("All"), None);
        assert_eq!(parse_frame_filter("2: photo.png"), Some(2));
        assert_eq!(parse_frame_filter("0: a b.jpg"), Some(0));
        assert_eq!(parse_frame_filter("garbage: x"), None);
    }

    #[test]
    fn test_frame_filter_choices() {
        let names = vec!["a.png".to_string(), "b.png".to_string()];
        assert_eq!(frame_filter_choices(&names), vec!["All", "0: a.png", "1: b.png"]);
    }

    #[test]
    fn test_camera_wireframe_from_identity_pose() {
        let params = SceneParams {
            conf_percent: 0.0,
            show_cameras: true,
            ..Default::default()
        };
        let scene = build_scene(&single_frame(), &params).unwrap();
        let wires = scene.cameras.unwrap();
        // 8 segments, two vertices each
        assert_eq!(wires.positions.len(), 16);
        // first segment starts at the camera center (identity pose, origin)
        assert_eq!(wires.positions[0], [0.0, 0.0, 0.0]);
        // frustum corners point down -Z after the display flip
        assert!(wires.positions[1][2] < 0.0);
    }

    #[test]
    fn test_cameras_absent_without_extrinsics() {
        let params = SceneParams {
            conf_percent: 0.0,
            show_cameras: true,
            ..Default::default()
        };
        let scene = build_scene(&two_frames(), &params).unwrap();
        assert!(scene.cameras.is_none());
    }

    #[test]
    fn test_pointmap_mode_falls_back_to_depth_branch() {
        let preds = single_frame();
        let depth_mode = build_scene(&preds, &keep_all_params()).unwrap();
        let pointmap_params = SceneParams {
            mode: PredictionMode::Pointmap,
            ..keep_all_params()
        };
        let pointmap_mode = build_scene(&preds, &pointmap_params).unwrap();
        assert_eq!(depth_mode.kept_points, pointmap_mode.kept_points);
    }

    #[test]
    fn test_glb_file_name_is_parameter_keyed() {
        let a = SceneParams::default();
        let b = SceneParams {
            mask_black_bg: true,
            ..SceneParams::default()
        };
        assert_ne!(a.glb_file_name(), b.glb_file_name());

        let filtered = SceneParams {
            frame_filter: "1: my photo.png".to_string(),
            ..SceneParams::default()
        };
        let name = filtered.glb_file_name();
        let stem = name.strip_suffix(".glb").unwrap();
        assert!(!stem.contains(':') && !stem.contains(' ') && !stem.contains('.'));
        assert!(name.starts_with("glbscene_"));
    }

    #[test]
    fn test_write_scene_reuses_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let preds = single_frame();
        let params = keep_all_params();

        let cached = dir.path().join(params.glb_file_name());
        std::fs::write(&cached, b"sentinel").unwrap();

        let path = write_scene(dir.path(), &preds, &params).unwrap();
        assert_eq!(path, cached);
        assert_eq!(std::fs::read(&path).unwrap(), b"sentinel");

        // a different combination builds a real container
        let other = SceneParams {
            mask_white_bg: true,
            ..keep_all_params()
        };
        let fresh = write_scene(dir.path(), &preds, &other).unwrap();
        assert_ne!(fresh, cached);
        let bytes = std::fs::read(&fresh).unwrap();
        assert_eq!(&bytes[0..4], b"glTF");
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-6);
        assert!((percentile(&values, 0.0) - 1.0).abs() < 1e-6);
        assert!((percentile(&values, 100.0) - 4.0).abs() < 1e-6);
    }
}
