mod commands;
mod enhance;
mod glb;
mod models;
mod predictions;
mod runner;
mod scene;
mod settings;
mod staging;

use commands::{
    clear_session, complete_first_run, enhance_image, get_settings, list_models, reconstruct,
    refresh_scene, stage_uploads, update_settings,
};
use tracing_subscriber::EnvFilter;

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .invoke_handler(tauri::generate_handler![
            stage_uploads,
            list_models,
            enhance_image,
            reconstruct,
            refresh_scene,
            clear_session,
            get_settings,
            update_settings,
            complete_first_run,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
