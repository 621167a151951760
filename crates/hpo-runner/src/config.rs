use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::WorkerError;

pub const DEFAULT_PANDA_URL: &str = "https://pandaserver.cern.ch:25443";
pub const DEFAULT_IDDS_URL: &str = "https://aipanda182.cern.ch:443";
pub const DEFAULT_SOURCE_URL: &str = "https://gridui07.usatlas.bnl.gov:25443";
pub const DEFAULT_OUTPUT_FILE: &str = "out.json";
pub const DEFAULT_IN_SAMPLE_FILE: &str = "input_sample.json";

const PROXY_ENV: &str = "X509_USER_PROXY";
const CA_DIR_ENV: &str = "X509_CERT_DIR";

/// Scheduler-assigned identity of this job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIdentity {
    pub panda_id: i64,
    pub task_id: i64,
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub panda_url: String,
    pub idds_url: String,
    pub source_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            panda_url: DEFAULT_PANDA_URL.to_string(),
            idds_url: DEFAULT_IDDS_URL.to_string(),
            source_url: DEFAULT_SOURCE_URL.to_string(),
        }
    }
}

/// Client certificate and key used for mutually authenticated TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca_dir: Option<PathBuf>,
}

impl Credentials {
    /// Grid proxy from `X509_USER_PROXY`, else the per-user default path.
    pub fn resolve() -> Self {
        let proxy = std::env::var_os(PROXY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_proxy_path);
        let ca_dir = std::env::var_os(CA_DIR_ENV).map(PathBuf::from);
        Self::from_proxy(proxy, ca_dir)
    }

    pub fn from_proxy(proxy: PathBuf, ca_dir: Option<PathBuf>) -> Self {
        Self {
            key: proxy.clone(),
            cert: proxy,
            ca_dir,
        }
    }
}

fn default_proxy_path() -> PathBuf {
    PathBuf::from(format!("/tmp/x509up_u{}", nix::unistd::getuid()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Resolve a sample, run the payload and report in one invocation.
    #[default]
    Full,
    /// Resolve and package only; the payload is run by someone else.
    Preprocess,
    /// Report only, using the run context left by a preprocess invocation.
    Postprocess,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Full => "full",
            Phase::Preprocess => "preprocess",
            Phase::Postprocess => "postprocess",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub script: Option<String>,
    pub job_params: String,
    pub libraries: Option<String>,
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InputSpec {
    pub files: Vec<String>,
    /// Named input streams; each key is a `%KEY` placeholder.
    pub streams: BTreeMap<String, Vec<String>>,
    pub direct_access: bool,
    /// Stream name to manifest file name.
    pub write_to_file: BTreeMap<String, String>,
}

impl InputSpec {
    /// Parses `STREAM:file,STREAM:file`. Malformed items are skipped.
    pub fn parse_write_to_file(raw: &str) -> BTreeMap<String, String> {
        raw.split(',')
            .filter_map(|item| {
                let parts: Vec<&str> = item.split(':').collect();
                match parts.as_slice() {
                    [stream, file] if !stream.is_empty() && !file.is_empty() => {
                        Some((stream.to_string(), file.to_string()))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job: JobIdentity,
    pub endpoints: Endpoints,
    pub credentials: Credentials,
    pub phase: Phase,
    pub payload: Payload,
    pub inputs: InputSpec,
    pub output_file: String,
    pub in_sample_file: String,
    pub run_dir: PathBuf,
    /// Directory the worker was launched from; the work directory lives below it.
    pub entry_dir: PathBuf,
    pub debug: bool,
}

impl WorkerConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.entry_dir.join("workDir")
    }

    pub fn run_path(&self) -> PathBuf {
        normalize_path(&self.work_dir().join(&self.run_dir))
    }

    /// The run directory is populated and then cleaned up, so it must not be
    /// the entry directory or one of its ancestors.
    pub fn check_run_dir(&self) -> Result<(), WorkerError> {
        let run_path = self.run_path();
        if normalize_path(&self.entry_dir).starts_with(&run_path) {
            return Err(WorkerError::MissingArgument(format!(
                "runDir {} resolves to {}, which contains the entry directory",
                self.run_dir.display(),
                run_path.display()
            )));
        }
        Ok(())
    }
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
