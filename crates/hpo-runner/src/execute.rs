use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{info, warn};
use uuid::Uuid;

use crate::fsutil::make_executable;
use crate::packaging::{normalize_exit_status, wrapper_script};

/// Where the payload writes its output while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Inherit the worker's stdio.
    Inherit,
    /// Spool to files in the run directory and echo afterwards.
    Spool,
}

/// Raw status of a finished process; a signal counts as `128 + signal`.
pub fn raw_status(status: &ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    1
}

fn path_with_cwd() -> OsString {
    let mut path = OsString::from(".");
    if let Some(existing) = std::env::var_os("PATH") {
        path.push(":");
        path.push(existing);
    }
    path
}

/// Best effort `chmod +x` on the payload entry point inside `run_dir`.
pub fn make_payload_executable(run_dir: &Path, script: Option<&str>, job_params: &str) {
    let entry = script
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| job_params.split_whitespace().next().map(str::to_string));
    if let Some(entry) = entry {
        let path = run_dir.join(&entry);
        if path.is_file() {
            if let Err(e) = make_executable(&path) {
                warn!(path = %path.display(), error = %e, "failed to make payload executable");
            }
        }
    }
}

/// Runs `command` through a generated `/bin/sh` wrapper in `run_dir` and
/// returns the payload status folded into 0..=254.
///
/// Failure to even start the wrapper is reported as status 1, the same as a
/// payload that failed on its own.
pub fn run_payload(run_dir: &Path, command: &str, mode: OutputMode) -> std::io::Result<i32> {
    let run_id = Uuid::new_v4();
    let wrapper = run_dir.join(format!("trf.{}.sh", run_id));
    let script = wrapper_script(command);
    fs::write(&wrapper, &script)?;
    make_executable(&wrapper)?;
    info!(wrapper = %wrapper.display(), command = %command, "executing payload");

    let mut cmd = Command::new("/bin/sh");
    cmd.arg(&wrapper);
    cmd.current_dir(run_dir);
    cmd.env("PATH", path_with_cwd());

    let (stdout_path, stderr_path) = match mode {
        OutputMode::Inherit => (None, None),
        OutputMode::Spool => {
            let out = run_dir.join(format!("tmp.stdout.{}", Uuid::new_v4()));
            let err = run_dir.join(format!("tmp.stderr.{}", Uuid::new_v4()));
            cmd.stdin(Stdio::null());
            cmd.stdout(fs::File::create(&out)?);
            cmd.stderr(fs::File::create(&err)?);
            (Some(out), Some(err))
        }
    };

    let raw = match cmd.status() {
        Ok(status) => raw_status(&status),
        Err(e) => {
            warn!(error = %e, "failed to start payload wrapper");
            1
        }
    };
    let status = normalize_exit_status(raw);

    if let Some(path) = stdout_path {
        echo_file(&path, None);
    }
    if let Some(path) = stderr_path {
        echo_file(&path, Some("=== stderr ==="));
    }
    info!(raw_status = raw, status, "payload finished");
    Ok(status)
}

fn echo_file(path: &Path, banner: Option<&str>) {
    let Ok(content) = fs::read(path) else {
        return;
    };
    let text = String::from_utf8_lossy(&content);
    if text.is_empty() {
        return;
    }
    if let Some(banner) = banner {
        println!("\n{}", banner);
    }
    print!("{}", text);
    if !text.ends_with('\n') {
        println!();
    }
}
