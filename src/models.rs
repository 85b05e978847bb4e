use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::runner::ProcessSpec;
use crate::settings;

/// Directory (under the models root) the single-image pipelines write staged
/// inputs into. The name is part of the external model contract: DarkIR's
/// fixed argument list and X-Restormer's option file both reference it.
pub const INPUT_DIR_NAME: &str = "input_128";
/// Directory (under the models root) the enhancement models write results to.
pub const OUTPUT_DIR_NAME: &str = "output_images";

/// The tabs of the app; every registered model belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SuperResolution,
    LowLight,
    Colorization,
    Reconstruction,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::SuperResolution => write!(f, "Super Resolution"),
            TaskKind::LowLight => write!(f, "Low Light"),
            TaskKind::Colorization => write!(f, "B/W to Color"),
            TaskKind::Reconstruction => write!(f, "3D Reconstruction"),
        }
    }
}

/// A registered external model: a pre-built inference program living in its
/// own virtualenv. All paths are relative to the models root so a checkout
/// can be moved wholesale.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub task: TaskKind,
    /// Per-model virtualenv interpreter, relative to the models root.
    pub interpreter: &'static str,
    /// Inference entry point script, relative to the models root.
    pub script: &'static str,
    /// Fixed arguments the entry point expects. Pipelines may append more.
    pub args: &'static [&'static str],
    /// Working directory the process must run in (scripts resolve their
    /// option files and relative data dirs against it).
    pub workdir: &'static str,
    pub description: &'static str,
}

/// Every model the tabs can invoke. The colorization tab ships without a
/// registered model; its dropdown stays empty and running it reports an
/// invalid selection instead of panicking.
pub static MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "x-restormer",
        label: "X-Restormer",
        task: TaskKind::SuperResolution,
        interpreter: "X-Restormer/venv/bin/python",
        script: "X-Restormer/xrestormer/test.py",
        args: &["-opt", "options/test/001_xrestormer_sr.yml"],
        workdir: "X-Restormer",
        description: "Transformer-based 4x super resolution",
    },
    ModelSpec {
        id: "darkir",
        label: "DarkIR",
        task: TaskKind::LowLight,
        interpreter: "DarkIR/venv_DarkIR/bin/python",
        script: "DarkIR/inference.py",
        args: &["-i", "../input_128/", "-o", "../output_images/"],
        workdir: "DarkIR",
        description: "Low-light enhancement and denoising",
    },
    ModelSpec {
        id: "vggt",
        label: "VGGT",
        task: TaskKind::Reconstruction,
        interpreter: "vggt/venv/bin/python3",
        script: "vggt/run.py",
        args: &[],
        workdir: "vggt",
        description: "Multi-view point cloud and camera pose estimation",
    },
];

impl ModelSpec {
    pub fn find_by_id(id: &str) -> Option<&'static ModelSpec> {
        MODEL_CATALOG.iter().find(|m| m.id == id)
    }

    pub fn by_task(task: TaskKind) -> Vec<&'static ModelSpec> {
        MODEL_CATALOG.iter().filter(|m| m.task == task).collect()
    }

    /// File name the enhancement models write their result under.
    pub fn output_file_name(&self) -> String {
        format!("temp_{}.png", self.label)
    }

    /// Resolve relative paths against `models_root`. When the model's own
    /// venv interpreter is missing, fall back to `fallback` so a checkout
    /// without pre-built environments still limps along.
    pub fn resolve(&'static self, models_root: &Path, fallback: &Path) -> ResolvedModel {
        let venv = models_root.join(self.interpreter);
        let (interpreter, used_fallback) = if settings::interpreter_available(&venv) {
            (venv, false)
        } else {
            warn!(
                model = self.id,
                missing = %venv.display(),
                fallback = %fallback.display(),
                "model venv not found, using fallback interpreter"
            );
            (fallback.to_path_buf(), true)
        };

        ResolvedModel {
            spec: self,
            interpreter,
            script: models_root.join(self.script),
            workdir: models_root.join(self.workdir),
            used_fallback,
        }
    }
}

/// A catalog entry with its paths made absolute and its interpreter picked.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub spec: &'static ModelSpec,
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub workdir: PathBuf,
    pub used_fallback: bool,
}

impl ResolvedModel {
    /// Full invocation: interpreter, script, the model's fixed args, then
    /// any per-run extras (the reconstruction pipeline appends its
    /// input/output directories here).
    pub fn command(&self, extra_args: &[String]) -> ProcessSpec {
        let mut args: Vec<String> = Vec::with_capacity(1 + self.spec.args.len() + extra_args.len());
        args.push(self.script.to_string_lossy().into_owned());
        args.extend(self.spec.args.iter().map(|a| a.to_string()));
        args.extend(extra_args.iter().cloned());

        ProcessSpec {
            program: self.interpreter.clone(),
            args,
            cwd: self.workdir.clone(),
        }
    }
}

/// What the UI needs to populate a tab's model dropdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub label: String,
    pub task: TaskKind,
    /// Human form of `task`, for tooltips and logs.
    pub task_label: String,
    pub description: String,
    /// Whether the model's own venv interpreter is present on disk.
    pub available: bool,
}

impl ModelInfo {
    pub fn from_spec(spec: &ModelSpec, models_root: &Path) -> Self {
        Self {
            id: spec.id.to_string(),
            label: spec.label.to_string(),
            task: spec.task,
            task_label: spec.task.to_string(),
            description: spec.description.to_string(),
            available: settings::interpreter_available(&models_root.join(spec.interpreter)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_id() {
        assert_eq!(ModelSpec::find_by_id("x-restormer").unwrap().label, "X-Restormer");
        assert!(ModelSpec::find_by_id("nope").is_none());
    }

    #[test]
    fn test_colorization_ships_empty() {
        assert!(ModelSpec::by_task(TaskKind::Colorization).is_empty());
        assert_eq!(ModelSpec::by_task(TaskKind::SuperResolution).len(), 1);
    }

    #[test]
    fn test_output_file_name_uses_label() {
        let spec = ModelSpec::find_by_id("x-restormer").unwrap();
        assert_eq!(spec.output_file_name(), "temp_X-Restormer.png");
    }

    #[test]
    fn test_model_info_carries_task_label() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ModelSpec::find_by_id("darkir").unwrap();
        let info = ModelInfo::from_spec(spec, dir.path());
        assert!(!info.available);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["task"], "low_light");
        assert_eq!(json["task_label"], "Low Light");
    }

    #[test]
    fn test_resolve_falls_back_when_venv_missing() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ModelSpec::find_by_id("vggt").unwrap();
        let resolved = spec.resolve(dir.path(), Path::new("/usr/bin/python3"));
        assert!(resolved.used_fallback);
        assert_eq!(resolved.interpreter, PathBuf::from("/usr/bin/python3"));
        assert_eq!(resolved.workdir, dir.path().join("vggt"));
    }

    #[test]
    fn test_resolve_prefers_existing_venv() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("vggt/venv/bin");
        std::fs::create_dir_all(&venv).unwrap();
        std::fs::write(venv.join("python3"), b"").unwrap();

        let spec = ModelSpec::find_by_id("vggt").unwrap();
        let resolved = spec.resolve(dir.path(), Path::new("/usr/bin/python3"));
        assert!(!resolved.used_fallback);
        assert_eq!(resolved.interpreter, venv.join("python3"));
    }

    #[test]
    fn test_command_appends_extra_args_last() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ModelSpec::find_by_id("darkir").unwrap();
        let resolved = spec.resolve(dir.path(), Path::new("python3"));
        let cmd = resolved.command(&[]);

        assert_eq!(cmd.args[0], dir.path().join("DarkIR/inference.py").to_string_lossy());
        assert_eq!(&cmd.args[1..], &["-i", "../input_128/", "-o", "../output_images/"]);
        assert_eq!(cmd.cwd, dir.path().join("DarkIR"));
    }
}
