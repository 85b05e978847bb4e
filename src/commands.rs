use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tauri::Emitter;
use tracing::{info, warn};

use crate::enhance::{self, EnhanceOutcome};
use crate::models::{ModelInfo, ModelSpec, TaskKind, MODEL_CATALOG};
use crate::predictions::PredictionSet;
use crate::runner;
use crate::scene::{self, SceneParams};
use crate::settings::AppSettings;
use crate::staging::{self, GalleryImage, Session};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructStatus {
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// `None` when nothing was uploaded.
    pub session_dir: Option<String>,
    pub gallery: Vec<GalleryImage>,
    pub log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructResult {
    pub glb_path: String,
    pub log: String,
    /// Dropdown choices for the frame filter, rebuilt from the staged files.
    pub frame_filter_choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResult {
    pub glb_path: String,
    pub log: String,
}

/// Settings for the current invocation. An unreadable settings file logs a
/// warning and falls back to defaults rather than blocking every command.
fn effective_settings() -> AppSettings {
    AppSettings::load().unwrap_or_else(|e| {
        warn!("failed to load settings, using defaults: {e:#}");
        AppSettings::default()
    })
}

fn emit_status(window: &tauri::Window, stage: &str, message: impl Into<String>) {
    let _ = window.emit(
        "reconstruct-status",
        ReconstructStatus {
            stage: stage.to_string(),
            message: message.into(),
        },
    );
}

/// Copies uploads into a fresh session directory and returns gallery
/// thumbnails for them.
#[tauri::command]
pub async fn stage_uploads(files: Vec<String>) -> Result<StageResult, String> {
    if files.is_empty() {
        return Ok(StageResult {
            session_dir: None,
            gallery: Vec::new(),
            log: "Please upload images to continue.".to_string(),
        });
    }

    let settings = effective_settings();
    let session =
        staging::create_session(&settings.staging_root()).map_err(|e| e.to_string())?;
    let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
    let staged = staging::stage_files(&session, &paths).map_err(|e| e.to_string())?;
    let gallery = staging::gallery_previews(&staged);

    info!(
        session = %session.dir.display(),
        count = staged.len(),
        "uploads staged"
    );
    Ok(StageResult {
        session_dir: Some(session.dir.to_string_lossy().into_owned()),
        gallery,
        log: "Upload complete. Click 'Reconstruct' to begin 3D processing.".to_string(),
    })
}

/// Registered models with their availability, for the tab dropdowns.
#[tauri::command]
pub fn list_models() -> Vec<ModelInfo> {
    let models_root = effective_settings().models_root();
    MODEL_CATALOG
        .iter()
        .map(|spec| ModelInfo::from_spec(spec, &models_root))
        .collect()
}

/// Runs a single-image model over one upload and returns the before/after
/// pair for the comparison slider.
#[tauri::command]
pub async fn enhance_image(model_id: String, image_path: String) -> Result<EnhanceOutcome, String> {
    let settings = effective_settings();
    enhance::enhance_image(
        &settings.models_root(),
        &settings.fallback_python(),
        &model_id,
        Path::new(&image_path),
    )
    .map_err(|e| e.to_string())
}

/// Full reconstruction pass over a staged session: run the model process,
/// load its prediction archive, write the scene file.
#[tauri::command]
pub async fn reconstruct(
    window: tauri::Window,
    session_dir: String,
    params: SceneParams,
) -> Result<ReconstructResult, String> {
    let session_path = Path::new(&session_dir);
    if session_dir.is_empty() || !session_path.is_dir() {
        return Err("No valid target directory found. Please upload images first.".to_string());
    }
    let session = Session::from_dir(session_path);
    let staged = session.staged_file_names();
    if staged.is_empty() {
        return Err("No images staged. Please upload images first.".to_string());
    }
    let frame_filter_choices = scene::frame_filter_choices(&staged);

    let settings = effective_settings();
    let models_root = settings.models_root();
    let Some(model) = ModelSpec::by_task(TaskKind::Reconstruction).into_iter().next() else {
        return Err("No reconstruction model is registered.".to_string());
    };

    let start = Instant::now();
    let results_dir = session.results_dir();
    fs::create_dir_all(&results_dir).map_err(|e| e.to_string())?;

    emit_status(
        &window,
        "running",
        format!("Running reconstruction on {} images...", staged.len()),
    );
    // Held until the scene file is written; a concurrent refresh must not
    // read a half-written archive or write the same cache file.
    let run_guard = runner::lock();
    let resolved = model.resolve(&models_root, &settings.fallback_python());
    let extra = [
        "--input_dir".to_string(),
        session.images_dir.to_string_lossy().into_owned(),
        "--output_dir".to_string(),
        results_dir.to_string_lossy().into_owned(),
    ];
    runner::run(&run_guard, &resolved.command(&extra)).map_err(|e| e.to_string())?;

    emit_status(&window, "loading", "Loading prediction arrays...");
    let npz_path = results_dir.join("predictions.npz");
    let preds = PredictionSet::load(&npz_path).map_err(|e| e.to_string())?;

    emit_status(&window, "writing", "Building visualization...");
    let glb_path =
        scene::write_scene(session_path, &preds, &params).map_err(|e| e.to_string())?;

    info!(
        session = %session.dir.display(),
        frames = staged.len(),
        "reconstruction finished in {:.1}s",
        start.elapsed().as_secs_f64()
    );
    Ok(ReconstructResult {
        glb_path: glb_path.to_string_lossy().into_owned(),
        log: format!(
            "Reconstruction Success ({} frames). Visualization complete.",
            staged.len()
        ),
        frame_filter_choices,
    })
}

/// Re-renders the scene for changed viewer parameters without rerunning the
/// model; hits the GLB cache when the combination was rendered before.
#[tauri::command]
pub async fn refresh_scene(
    session_dir: String,
    params: SceneParams,
) -> Result<RefreshResult, String> {
    let session_path = Path::new(&session_dir);
    if session_dir.is_empty() || !session_path.is_dir() {
        return Err(
            "No reconstruction available. Please click the Reconstruct button first.".to_string(),
        );
    }
    let session = Session::from_dir(session_path);
    let npz_path = session.results_dir().join("predictions.npz");
    if !npz_path.is_file() {
        return Err(format!(
            "No reconstruction available at {}. Please run 'Reconstruct' first.",
            npz_path.display()
        ));
    }

    // Archive reads and cache writes serialize on the model pipeline gate.
    let _run_guard = runner::lock();
    let preds = PredictionSet::load(&npz_path).map_err(|e| e.to_string())?;
    let glb_path =
        scene::write_scene(session_path, &preds, &params).map_err(|e| e.to_string())?;
    Ok(RefreshResult {
        glb_path: glb_path.to_string_lossy().into_owned(),
        log: "Visualization updated.".to_string(),
    })
}

/// Deletes a session's staging directory (upload gallery "Clear" button).
#[tauri::command]
pub async fn clear_session(session_dir: String) -> Result<(), String> {
    staging::clear_session(Path::new(&session_dir)).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_settings() -> Result<AppSettings, String> {
    AppSettings::load().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn update_settings(settings: AppSettings) -> Result<(), String> {
    settings.save().map_err(|e| e.to_string())
}

/// Marks the first-run welcome as seen.
#[tauri::command]
pub fn complete_first_run() -> Result<(), String> {
    let mut settings = effective_settings();
    settings.complete_first_run().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_params_deserialize_with_defaults() {
        let params: SceneParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.conf_percent, 50.0);
        assert_eq!(params.frame_filter, "All");
        assert!(params.show_cameras);
    }

    #[test]
    fn test_stage_result_roundtrip() {
        let result = StageResult {
            session_dir: None,
            gallery: Vec::new(),
            log: "Please upload images to continue.".to_string(),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"session_dir\":null"));
    }
}
