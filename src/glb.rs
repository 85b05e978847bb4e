use anyhow::{bail, Result};
use serde_json::json;
use std::fs;
use std::path::Path;

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
const CHUNK_BIN: u32 = 0x004E_4942; // "BIN\0"
const TARGET_ARRAY_BUFFER: u32 = 34962;
const COMPONENT_F32: u32 = 5126;
const COMPONENT_U8: u32 = 5121;
const MODE_POINTS: u32 = 0;
const MODE_LINES: u32 = 1;

/// Vertices for one primitive: positions with matching RGBA colors.
#[derive(Debug, Clone, Default)]
pub struct VertexSet {
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 4]>,
}

impl VertexSet {
    pub fn push(&mut self, position: [f32; 3], color: [u8; 4]) {
        self.positions.push(position);
        self.colors.push(color);
    }
}

/// Writes the point cloud (and optional camera wireframe) as a binary glTF
/// file the system viewer can open directly.
pub fn write_glb(path: &Path, points: &VertexSet, lines: Option<&VertexSet>) -> Result<()> {
    fs::write(path, encode(points, lines)?)?;
    Ok(())
}

/// Serializes a binary glTF container: 12-byte header, JSON chunk padded
/// with spaces, vertex BIN chunk padded with zeros, both 4-byte aligned.
/// The cloud becomes a POINTS primitive with POSITION/COLOR_0; the
/// wireframe, when present, a LINES primitive.
pub fn encode(points: &VertexSet, lines: Option<&VertexSet>) -> Result<Vec<u8>> {
    if points.positions.is_empty() {
        bail!("refusing to write an empty point cloud");
    }
    check_counts("point", points)?;
    let lines = lines.filter(|l| !l.positions.is_empty());
    if let Some(lines) = lines {
        check_counts("line", lines)?;
        if lines.positions.len() % 2 != 0 {
            bail!("line vertices must come in pairs, got {}", lines.positions.len());
        }
    }

    let mut builder = BinBuilder::default();
    let point_pos = builder.push_positions(&points.positions);
    let point_col = builder.push_colors(&points.colors);

    let mut meshes = vec![json!({
        "primitives": [{
            "attributes": { "POSITION": point_pos, "COLOR_0": point_col },
            "mode": MODE_POINTS,
        }]
    })];
    let mut nodes = vec![json!({ "mesh": 0, "name": "points" })];

    if let Some(lines) = lines {
        let line_pos = builder.push_positions(&lines.positions);
        let line_col = builder.push_colors(&lines.colors);
        meshes.push(json!({
            "primitives": [{
                "attributes": { "POSITION": line_pos, "COLOR_0": line_col },
                "mode": MODE_LINES,
            }]
        }));
        nodes.push(json!({ "mesh": 1, "name": "cameras" }));
    }

    let node_indices: Vec<usize> = (0..nodes.len()).collect();
    let root = json!({
        "asset": { "version": "2.0", "generator": "enhance-studio" },
        "scene": 0,
        "scenes": [{ "nodes": node_indices }],
        "nodes": nodes,
        "meshes": meshes,
        "buffers": [{ "byteLength": builder.bin.len() }],
        "bufferViews": builder.views,
        "accessors": builder.accessors,
    });

    let mut json_bytes = serde_json::to_vec(&root)?;
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }
    let mut bin = builder.bin;
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let total = 12 + 8 + json_bytes.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);

    Ok(out)
}

fn check_counts(what: &str, set: &VertexSet) -> Result<()> {
    if set.positions.len() != set.colors.len() {
        bail!(
            "{} positions and colors disagree: {} vs {}",
            what,
            set.positions.len(),
            set.colors.len()
        );
    }
    Ok(())
}

#[derive(Default)]
struct BinBuilder {
    bin: Vec<u8>,
    views: Vec<serde_json::Value>,
    accessors: Vec<serde_json::Value>,
}

impl BinBuilder {
    // Position stride is 12 bytes and color stride 4, so every view offset
    // stays 4-byte aligned without explicit padding.
    fn push_positions(&mut self, positions: &[[f32; 3]]) -> usize {
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytemuck::cast_slice(positions));
        let (min, max) = bounds(positions);
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": positions.len() * 12,
            "target": TARGET_ARRAY_BUFFER,
        }));
        self.accessors.push(json!({
            "bufferView": self.views.len() - 1,
            "componentType": COMPONENT_F32,
            "count": positions.len(),
            "type": "VEC3",
            "min": min,
            "max": max,
        }));
        self.accessors.len() - 1
    }

    fn push_colors(&mut self, colors: &[[u8; 4]]) -> usize {
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytemuck::cast_slice(colors));
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": colors.len() * 4,
            "target": TARGET_ARRAY_BUFFER,
        }));
        self.accessors.push(json!({
            "bufferView": self.views.len() - 1,
            "componentType": COMPONENT_U8,
            "normalized": true,
            "count": colors.len(),
            "type": "VEC4",
        }));
        self.accessors.len() - 1
    }
}

// POSITION accessors must carry min/max per the glTF spec.
fn bounds(positions: &[[f32; 3]]) -> (Vec<f32>, Vec<f32>) {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    (min.to_vec(), max.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> VertexSet {
        VertexSet {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 2.0, -3.0]],
            colors: vec![[255, 0, 0, 255], [0, 255, 0, 255]],
        }
    }

    fn parse(bytes: &[u8]) -> (serde_json::Value, Vec<u8>) {
        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        let total = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        assert_eq!(total, bytes.len());

        let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        assert_eq!(json_len % 4, 0);
        assert_eq!(&bytes[16..20], b"JSON");
        let json: serde_json::Value = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();

        let bin_start = 20 + json_len;
        let bin_len =
            u32::from_le_bytes(bytes[bin_start..bin_start + 4].try_into().unwrap()) as usize;
        assert_eq!(bin_len % 4, 0);
        assert_eq!(&bytes[bin_start + 4..bin_start + 8], b"BIN\0");
        let bin = bytes[bin_start + 8..bin_start + 8 + bin_len].to_vec();
        (json, bin)
    }

    #[test]
    fn test_points_only_container() {
        let points = sample_points();
        let bytes = encode(&points, None).unwrap();
        let (json, bin) = parse(&bytes);

        assert_eq!(json["meshes"].as_array().unwrap().len(), 1);
        assert_eq!(json["meshes"][0]["primitives"][0]["mode"], 0);
        assert_eq!(json["accessors"][0]["count"], 2);
        assert_eq!(json["accessors"][0]["min"], serde_json::json!([0.0, 0.0, -3.0]));
        assert_eq!(json["accessors"][0]["max"], serde_json::json!([1.0, 2.0, 0.0]));
        assert_eq!(json["accessors"][1]["normalized"], true);
        assert_eq!(json["buffers"][0]["byteLength"], bin.len());

        // BIN chunk starts with the raw position floats
        let expected: &[u8] = bytemuck::cast_slice(&points.positions);
        assert_eq!(&bin[..expected.len()], expected);
    }

    #[test]
    fn test_camera_wireframe_gets_lines_primitive() {
        let points = sample_points();
        let lines = VertexSet {
            positions: vec![[0.0, 0.0, 0.0], [0.0, 0.0, -1.0]],
            colors: vec![[255, 255, 255, 255]; 2],
        };
        let bytes = encode(&points, Some(&lines)).unwrap();
        let (json, _) = parse(&bytes);

        assert_eq!(json["meshes"].as_array().unwrap().len(), 2);
        assert_eq!(json["meshes"][1]["primitives"][0]["mode"], 1);
        assert_eq!(json["scenes"][0]["nodes"], serde_json::json!([0, 1]));
        assert_eq!(json["nodes"][1]["name"], "cameras");
    }

    #[test]
    fn test_empty_wireframe_is_dropped() {
        let bytes = encode(&sample_points(), Some(&VertexSet::default())).unwrap();
        let (json, _) = parse(&bytes);
        assert_eq!(json["meshes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_cloud_is_an_error() {
        assert!(encode(&VertexSet::default(), None).is_err());
    }

    #[test]
    fn test_mismatched_colors_are_an_error() {
        let set = VertexSet {
            positions: vec![[0.0; 3]; 2],
            colors: vec![[0; 4]; 1],
        };
        assert!(encode(&set, None).is_err());
    }

    #[test]
    fn test_odd_line_vertex_count_is_an_error() {
        let lines = VertexSet {
            positions: vec![[0.0; 3]; 3],
            colors: vec![[0; 4]; 3],
        };
        assert!(encode(&sample_points(), Some(&lines)).is_err());
    }

    #[test]
    fn test_write_glb_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.glb");
        write_glb(&path, &sample_points(), None).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        parse(&bytes);
    }
}
