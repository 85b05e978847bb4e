use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::models::{ModelSpec, TaskKind, INPUT_DIR_NAME, OUTPUT_DIR_NAME};
use crate::runner;
use crate::staging;

/// Inputs are boxed to fit within this edge before staging. The bundled
/// enhancement models expect inputs at this size.
pub const ENHANCE_MAX_EDGE: u32 = 256;

/// What the comparison view renders after a single-image run.
#[derive(Debug, Clone, Serialize)]
pub struct EnhanceOutcome {
    /// The staged model input (post-resize), as a data URI.
    pub before: String,
    /// The model's output image, as a data URI.
    pub after: String,
    pub info: String,
}

/// Runs one single-image model end to end: resize and stage the upload,
/// invoke the model process, collect its output file.
pub fn enhance_image(
    models_root: &Path,
    python_fallback: &Path,
    model_id: &str,
    image_path: &Path,
) -> Result<EnhanceOutcome> {
    let Some(spec) = ModelSpec::find_by_id(model_id) else {
        bail!("Invalid model selection");
    };
    if spec.task == TaskKind::Reconstruction {
        // the reconstruction pipeline stages whole sessions, not single files
        bail!("Invalid model selection");
    }

    let start = Instant::now();
    let img = image::open(image_path)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;
    let staged = img.resize(ENHANCE_MAX_EDGE, ENHANCE_MAX_EDGE, FilterType::Lanczos3);

    // Models share the input_128/output_images staging dirs; the gate is
    // held from staging the input until the output is collected.
    let run_guard = runner::lock();
    let input_dir = models_root.join(INPUT_DIR_NAME);
    let output_dir = models_root.join(OUTPUT_DIR_NAME);
    fs::create_dir_all(&input_dir)
        .with_context(|| format!("Failed to create {}", input_dir.display()))?;
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let staged_path = input_dir.join("temp.png");
    staged
        .save(&staged_path)
        .with_context(|| format!("Failed to write {}", staged_path.display()))?;

    let resolved = spec.resolve(models_root, python_fallback);
    runner::run(&run_guard, &resolved.command(&[]))?;

    let result_path = output_dir.join(spec.output_file_name());
    if !result_path.is_file() {
        bail!("Model did not produce {}", result_path.display());
    }
    let result = image::open(&result_path)
        .with_context(|| format!("Failed to read model output {}", result_path.display()))?;
    drop(run_guard);

    info!(
        model = spec.id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "enhancement run finished"
    );

    Ok(EnhanceOutcome {
        before: staging::png_data_uri(&staged)?,
        after: staging::png_data_uri(&result)?,
        info: format!("Used model: {}", spec.label),
    })
}
