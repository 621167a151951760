use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::client::{ArchiveFetcher, JobScheduler, SampleCoordinator};
use crate::config::{Phase, WorkerConfig};
use crate::context::{ContextStore, RunContext};
use crate::error::WorkerError;
use crate::execute::{make_payload_executable, run_payload, OutputMode};
use crate::fsutil::{ensure_dir, list_dir, make_executable, remove_file_if_exists};
use crate::packaging::{
    command_line, preprocess_script, substitute_inputs, write_input_manifests,
};
use crate::report::{report_result, ReportOutcome};
use crate::resolve::{resolve_sample, Resolution};
use crate::staging::{prepare_payload_archives, stage_inputs, PoolFileCatalog, POOL_FILE_CATALOG};

pub const PREPROCESS_SCRIPT: &str = "__run_main_exec.sh";

const EMPTY_POOL_FILE_CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<!-- Edited By POOL -->
<!DOCTYPE POOLFILECATALOG SYSTEM "InMemory">
<POOLFILECATALOG>

</POOLFILECATALOG>
"#;

const USEFUL_FILE_PATTERNS: [&str; 4] = ["runargs.*", "runwrapper.*", "jobReport.json", "log.*"];

/// How a worker invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// No sample to evaluate (or none reachable); nothing was run.
    NoWork,
    /// Preprocess finished; the script to run was written.
    Prepared { script: PathBuf },
    /// Report phase ran; `status` is the payload status.
    Completed { status: i32, report: ReportOutcome },
}

impl WorkerOutcome {
    pub fn exit_status(&self) -> i32 {
        match self {
            WorkerOutcome::NoWork | WorkerOutcome::Prepared { .. } => 0,
            WorkerOutcome::Completed { status, .. } => *status,
        }
    }
}

/// Remote collaborators of one worker invocation.
pub struct Services<'a> {
    pub scheduler: &'a dyn JobScheduler,
    pub coordinator: &'a dyn SampleCoordinator,
    pub fetcher: &'a dyn ArchiveFetcher,
}

pub fn run_worker(config: &WorkerConfig, services: &Services<'_>) -> Result<WorkerOutcome, WorkerError> {
    info!(
        phase = config.phase.as_str(),
        panda_id = config.job.panda_id,
        task_id = config.job.task_id,
        entry_dir = %config.entry_dir.display(),
        "starting worker"
    );
    config.check_run_dir()?;
    let work_dir = config.work_dir();
    let run_dir = config.run_path();
    let store = ContextStore::new(&run_dir, &config.in_sample_file);

    let (context, status) = match config.phase {
        Phase::Postprocess => match pending_report(config)? {
            Some(context) => (context, 0),
            None => {
                info!("exit due to no event");
                return Ok(WorkerOutcome::NoWork);
            }
        },
        Phase::Full | Phase::Preprocess => {
            match prepare_and_run(config, services, &work_dir, &run_dir, &store)? {
                Prepared::NoWork => return Ok(WorkerOutcome::NoWork),
                Prepared::Script(script) => return Ok(WorkerOutcome::Prepared { script }),
                Prepared::Ran { context, status } => (context, status),
            }
        }
    };

    debug!(listing = %list_dir(&run_dir), "run directory after execution");
    let report = report_result(
        &context,
        &run_dir.join(&config.output_file),
        services.scheduler,
        services.coordinator,
    );
    if let Err(e) = store.clear() {
        warn!(error = %e, "failed to clear run context");
    }
    finalize(config, &work_dir, &run_dir);

    if status != 0 {
        warn!(status, "running script failed");
    } else {
        info!("running script was successful");
    }
    Ok(WorkerOutcome::Completed { status, report })
}

/// Run context left by a preprocess invocation, if there is anything to
/// report for it.
pub fn pending_report(config: &WorkerConfig) -> Result<Option<RunContext>, WorkerError> {
    config.check_run_dir()?;
    ContextStore::new(&config.run_path(), &config.in_sample_file).load()
}

enum Prepared {
    NoWork,
    Script(PathBuf),
    Ran { context: RunContext, status: i32 },
}

fn prepare_and_run(
    config: &WorkerConfig,
    services: &Services<'_>,
    work_dir: &Path,
    run_dir: &Path,
    store: &ContextStore,
) -> Result<Prepared, WorkerError> {
    if work_dir.exists() {
        fs::remove_dir_all(work_dir)?;
    }
    ensure_dir(work_dir)?;

    let catalog = PoolFileCatalog::load_or_empty(&config.entry_dir.join(POOL_FILE_CATALOG));
    prepare_payload_archives(
        &config.payload,
        &config.entry_dir,
        work_dir,
        &config.endpoints.source_url,
        services.fetcher,
    )?;
    ensure_dir(run_dir)?;
    store.clear()?;

    let inputs = stage_inputs(&config.inputs, &catalog, &config.entry_dir, run_dir)?;
    debug!(listing = %list_dir(run_dir), "run directory after staging");
    make_payload_executable(
        run_dir,
        config.payload.script.as_deref(),
        &config.payload.job_params,
    );

    let job_params = substitute_inputs(&config.payload.job_params, &inputs);
    write_input_manifests(run_dir, &config.inputs.write_to_file, &inputs)?;
    let command = command_line(config.payload.script.as_deref(), &job_params);
    info!(command = %command, "packaged command");

    let context = match resolve_sample(config.job, services.scheduler, services.coordinator, store)? {
        Resolution::Resolved { context, .. } => context,
        Resolution::NoWork => {
            info!("exit due to no event");
            return Ok(Prepared::NoWork);
        }
        Resolution::Exhausted { attempts } => {
            info!(attempts, "exit due to no event");
            return Ok(Prepared::NoWork);
        }
    };

    if config.phase == Phase::Preprocess {
        let script_path = config.entry_dir.join(PREPROCESS_SCRIPT);
        let relative = run_dir
            .strip_prefix(&config.entry_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| run_dir.to_path_buf());
        fs::write(&script_path, preprocess_script(&relative, &command))?;
        make_executable(&script_path)?;
        info!(script = %script_path.display(), "preprocessing successfully done");
        return Ok(Prepared::Script(script_path));
    }

    let mode = if config.debug {
        OutputMode::Inherit
    } else {
        OutputMode::Spool
    };
    let status = run_payload(run_dir, &command, mode)?;
    Ok(Prepared::Ran { context, status })
}

fn useful_files() -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in USEFUL_FILE_PATTERNS {
        builder.add(Glob::new(pattern).ok()?);
    }
    builder.build().ok()
}

fn move_into(src: &Path, dest_dir: &Path) {
    let Some(name) = src.file_name() else {
        return;
    };
    let dest = dest_dir.join(name);
    if src == dest {
        return;
    }
    if let Err(e) = fs::rename(src, &dest) {
        warn!(src = %src.display(), dest = %dest.display(), error = %e, "failed to move file");
    }
}

/// Hands results back to the entry directory and drops the work directory.
fn finalize(config: &WorkerConfig, work_dir: &Path, run_dir: &Path) {
    let entry = &config.entry_dir;

    let output = run_dir.join(&config.output_file);
    if output.exists() {
        move_into(&output, entry);
    }

    let catalog = run_dir.join(POOL_FILE_CATALOG);
    if !catalog.exists() {
        if let Err(e) = fs::write(&catalog, EMPTY_POOL_FILE_CATALOG) {
            warn!(error = %e, "failed to create empty pool file catalog");
        }
    }
    if catalog.exists() && catalog != entry.join(POOL_FILE_CATALOG) {
        let _ = remove_file_if_exists(&entry.join(POOL_FILE_CATALOG));
        move_into(&catalog, entry);
    }

    if let (Some(globs), Ok(entries)) = (useful_files(), fs::read_dir(run_dir)) {
        for entry_file in entries.filter_map(|e| e.ok()) {
            if globs.is_match(entry_file.file_name()) {
                move_into(&entry_file.path(), entry);
            }
        }
    }

    debug!(listing = %list_dir(entry), "entry directory");
    if !config.debug {
        if let Err(e) = fs::remove_dir_all(work_dir) {
            warn!(work_dir = %work_dir.display(), error = %e, "failed to remove work directory");
        }
    }
}
