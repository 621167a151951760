//! Turns a job parameter template plus staged inputs into the literal
//! command the payload runs with.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::fsutil::{atomic_write_json_pretty, remove_file_if_exists};

/// Placeholder and manifest key used when no named streams are given.
pub const DEFAULT_STREAM: &str = "IN";

/// Inputs after staging, in the form the payload will see them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagedInputs {
    pub all: Vec<String>,
    pub streams: BTreeMap<String, Vec<String>>,
}

impl PackagedInputs {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Substitutes input placeholders in `template`.
///
/// With no named streams every `%IN` is replaced by all inputs joined with
/// commas. With named streams each `%NAME` is replaced only when followed by
/// a space, a quote or the end of the string, so `%IN` never eats into
/// `%INPUT2`.
pub fn substitute_inputs(template: &str, inputs: &PackagedInputs) -> String {
    if inputs.streams.is_empty() {
        if inputs.all.is_empty() {
            return template.to_string();
        }
        return template.replace(&format!("%{}", DEFAULT_STREAM), &inputs.all.join(","));
    }
    let mut out = template.to_string();
    for (token, files) in &inputs.streams {
        let pattern = match Regex::new(&format!(r#"%{}( |$|"|')"#, regex::escape(token))) {
            Ok(pattern) => pattern,
            Err(_) => continue,
        };
        let joined = files.join(",");
        out = pattern
            .replace_all(&out, |caps: &Captures<'_>| format!("{}{}", joined, &caps[1]))
            .into_owned();
    }
    out
}

/// Writes each requested stream as a JSON list into `run_dir`.
pub fn write_input_manifests(
    run_dir: &Path,
    write_to_file: &BTreeMap<String, String>,
    inputs: &PackagedInputs,
) -> std::io::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if write_to_file.is_empty() {
        return Ok(written);
    }
    let default_stream;
    let streams = if inputs.streams.is_empty() {
        default_stream = BTreeMap::from([(DEFAULT_STREAM.to_string(), inputs.all.clone())]);
        &default_stream
    } else {
        &inputs.streams
    };
    for (stream, files) in streams {
        let Some(file_name) = write_to_file.get(stream) else {
            continue;
        };
        let path = run_dir.join(file_name);
        remove_file_if_exists(&path)?;
        atomic_write_json_pretty(&path, files)?;
        info!(stream = %stream, path = %path.display(), files = ?files, "wrote input manifest");
        written.push(path);
    }
    Ok(written)
}

pub fn command_line(script: Option<&str>, job_params: &str) -> String {
    match script.map(str::trim).filter(|s| !s.is_empty()) {
        Some(script) => format!("{} {}", script, job_params).trim_end().to_string(),
        None => job_params.trim().to_string(),
    }
}

/// Shell wrapper executed by the worker; folds the payload status into
/// 0..=254 itself so the value survives any outer shell.
pub fn wrapper_script(command: &str) -> String {
    format!(
        "#!/bin/sh\n{}\nstatus=$?\nexit $((status % 255))\n",
        command
    )
}

/// Script left behind by a preprocess invocation for an external runner.
pub fn preprocess_script(run_dir_from_entry: &Path, command: &str) -> String {
    let cd_target = if run_dir_from_entry.as_os_str().is_empty() {
        ".".to_string()
    } else {
        run_dir_from_entry.to_string_lossy().to_string()
    };
    format!(
        "cd {}\nexport PATH=$PATH:.\n{}\n",
        shell_quote(&cd_target),
        command
    )
}

/// Maps any raw payload status into 0..=254.
pub fn normalize_exit_status(raw: i64) -> i32 {
    (raw.rem_euclid(256) % 255) as i32
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=+@%,".contains(&b));
    if plain {
        return s.to_string();
    }
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
