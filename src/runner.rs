use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// One external model invocation: interpreter, full argument list (script
/// path first), and the working directory the script expects to run in.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    /// Human-readable command line for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The process ran but reported failure; the captured stderr is the
    /// message shown to the user.
    #[error("{program} failed with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Exclusive access to the model pipeline. Every registered model assumes it
/// owns its working directory and the shared input_128/output_images staging
/// dirs, so callers hold this from the first staged write until results are
/// collected, not just around the child process.
pub struct RunGuard {
    _gate: MutexGuard<'static, ()>,
}

static RUN_GATE: Mutex<()> = Mutex::new(());

/// Blocks until no other pipeline holds the gate.
pub fn lock() -> RunGuard {
    RunGuard {
        _gate: RUN_GATE.lock().unwrap_or_else(|e| e.into_inner()),
    }
}

/// Runs the external process to completion with captured output. Nonzero
/// exit status becomes `ProcessError::Failed` carrying the stderr text;
/// stdout is logged, never parsed. The guard parameter keeps unserialized
/// invocations from compiling.
pub fn run(_guard: &RunGuard, spec: &ProcessSpec) -> Result<String, ProcessError> {
    info!(cwd = %spec.cwd.display(), "running {}", spec.command_line());

    let output = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .output()
        .map_err(|source| ProcessError::Launch {
            program: spec.program.to_string_lossy().into_owned(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ProcessError::Failed {
            program: spec.program.to_string_lossy().into_owned(),
            status: output.status,
            stderr,
        });
    }

    if !stdout.trim().is_empty() {
        debug!(stdout = %stdout.trim_end(), "model process stdout");
    }
    if !stderr.trim().is_empty() {
        debug!(stderr = %stderr.trim_end(), "model process stderr");
    }

    Ok(stdout)
}
