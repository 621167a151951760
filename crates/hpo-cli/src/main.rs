use anyhow::{anyhow, bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use hpo_runner::config::{
    DEFAULT_IDDS_URL, DEFAULT_IN_SAMPLE_FILE, DEFAULT_OUTPUT_FILE, DEFAULT_PANDA_URL,
    DEFAULT_SOURCE_URL,
};
use hpo_runner::error::{EC_MISSING_ARG, EC_WGET};
use hpo_runner::{
    pending_report, run_worker, Credentials, Endpoints, HttpTransport, IddsClient, InputSpec,
    JobIdentity, PandaClient, Payload, Phase, Services, WorkerConfig, WorkerOutcome,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "runhpo",
    version,
    about = "Evaluate one hyperparameter sample for a PanDA job and report its loss to iDDS"
)]
struct Cli {
    /// Library tarball to expand into the work directory.
    #[arg(short = 'l', long = "libraries", default_value = "")]
    libraries: String,
    /// Payload script.
    #[arg(short = 'j', long = "script")]
    script: Option<String>,
    /// URL-encoded job parameters with %IN / %STREAM placeholders.
    #[arg(short = 'p', long = "jobParams", default_value = "", allow_hyphen_values = true)]
    job_params: String,
    /// Input files as a list literal, e.g. "['a.h5','b.h5']".
    #[arg(short = 'i', long = "inputFiles", default_value = "[]")]
    input_files: String,
    #[arg(short = 'o', long = "outputFile", default_value = DEFAULT_OUTPUT_FILE)]
    output_file: String,
    /// Job-option archive fetched from the source cache when no libraries are given.
    #[arg(short = 'a', long = "archiveJobO", default_value = "")]
    archive: String,
    #[arg(long)]
    debug: bool,
    #[arg(long = "directIn")]
    direct_in: bool,
    #[arg(long = "sourceURL", default_value = DEFAULT_SOURCE_URL)]
    source_url: String,
    #[arg(long = "pandaURL", default_value = DEFAULT_PANDA_URL)]
    panda_url: String,
    #[arg(long = "iddsURL", default_value = DEFAULT_IDDS_URL)]
    idds_url: String,
    /// Named input streams as a dict literal, e.g. "{'IN': ['a'], 'BKG': ['b']}".
    #[arg(long = "inMap", default_value = "{}")]
    in_map: String,
    /// STREAM:file pairs; each stream is also written to that file as a JSON list.
    #[arg(long = "writeInputToTxt", default_value = "")]
    write_input_to_txt: String,
    #[arg(long = "pandaID", env = "PandaID")]
    panda_id: Option<i64>,
    #[arg(long = "taskID", env = "PanDA_TaskID")]
    task_id: Option<i64>,
    #[arg(long = "inSampleFile", default_value = DEFAULT_IN_SAMPLE_FILE)]
    in_sample_file: String,
    #[arg(long = "runDir", default_value = "./")]
    run_dir: PathBuf,
    /// Resolve and package only, leaving __run_main_exec.sh behind.
    #[arg(long, conflicts_with = "postprocess")]
    preprocess: bool,
    /// Report only, from the run context left by --preprocess.
    #[arg(long)]
    postprocess: bool,

    // Accepted for pilot compatibility; no effect.
    #[arg(long = "pilotpars", hide = true)]
    _pilotpars: bool,
    #[arg(long = "oldPrefix", hide = true)]
    _old_prefix: Option<String>,
    #[arg(long = "newPrefix", hide = true)]
    _new_prefix: Option<String>,
    #[arg(long = "usePFCTurl", hide = true)]
    _use_pfc_turl: bool,
    #[arg(long = "accessmode", hide = true)]
    _access_mode: Option<String>,
    #[arg(long = "inputGUIDs", hide = true)]
    _input_guids: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EC_MISSING_ARG,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let entry_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "cannot determine current directory");
            return EC_MISSING_ARG;
        }
    };
    let config = match build_config(cli, entry_dir, Credentials::resolve()) {
        Ok(config) => config,
        Err(err) => {
            error!("missing parameters: {:#}", err);
            return EC_MISSING_ARG;
        }
    };
    log_parameters(&config);
    execute(&config)
}

fn execute(config: &WorkerConfig) -> i32 {
    if config.phase == Phase::Postprocess {
        match pending_report(config) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("exit due to no event");
                return 0;
            }
            Err(e) => {
                error!(error = %e, exit_code = e.exit_code(), "worker failed");
                return e.exit_code();
            }
        }
    }

    let transport = match HttpTransport::new(&config.credentials) {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, "failed to set up HTTP client");
            return EC_WGET;
        }
    };
    let panda = PandaClient::new(transport.clone(), &config.endpoints.panda_url);
    let idds = IddsClient::new(transport.clone(), &config.endpoints.idds_url);
    let services = Services {
        scheduler: &panda,
        coordinator: &idds,
        fetcher: &transport,
    };

    match run_worker(config, &services) {
        Ok(outcome) => {
            match &outcome {
                WorkerOutcome::NoWork => info!("exit due to no event"),
                WorkerOutcome::Prepared { script } => {
                    info!(script = %script.display(), "produced preprocess script")
                }
                WorkerOutcome::Completed { status, report } => {
                    info!(status, report = ?report, "worker finished")
                }
            }
            outcome.exit_status()
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "worker failed");
            e.exit_code()
        }
    }
}

fn build_config(cli: Cli, entry_dir: PathBuf, credentials: Credentials) -> Result<WorkerConfig> {
    let panda_id = cli
        .panda_id
        .ok_or_else(|| anyhow!("pandaID is not set (use --pandaID or PandaID)"))?;
    let task_id = cli
        .task_id
        .ok_or_else(|| anyhow!("taskID is not set (use --taskID or PanDA_TaskID)"))?;
    let phase = match (cli.preprocess, cli.postprocess) {
        (true, _) => Phase::Preprocess,
        (false, true) => Phase::Postprocess,
        (false, false) => Phase::Full,
    };
    let job_params = urlencoding::decode(&cli.job_params)
        .context("jobParams is not valid URL-encoded UTF-8")?
        .into_owned();
    if phase != Phase::Postprocess
        && cli.script.as_deref().map_or(true, |s| s.trim().is_empty())
        && job_params.trim().is_empty()
    {
        bail!("neither a script (-j) nor job parameters (-p) were given");
    }
    let files = parse_string_list(&cli.input_files).context("invalid -i")?;
    let streams = parse_stream_map(&cli.in_map).context("invalid --inMap")?;

    Ok(WorkerConfig {
        job: JobIdentity { panda_id, task_id },
        endpoints: Endpoints {
            panda_url: cli.panda_url,
            idds_url: cli.idds_url,
            source_url: cli.source_url,
        },
        credentials,
        phase,
        payload: Payload {
            script: cli.script.filter(|s| !s.trim().is_empty()),
            job_params,
            libraries: Some(cli.libraries).filter(|s| !s.is_empty()),
            archive: Some(cli.archive).filter(|s| !s.is_empty()),
        },
        inputs: InputSpec {
            files,
            streams,
            direct_access: cli.direct_in,
            write_to_file: InputSpec::parse_write_to_file(&cli.write_input_to_txt),
        },
        output_file: cli.output_file,
        in_sample_file: cli.in_sample_file,
        run_dir: cli.run_dir,
        entry_dir,
        debug: cli.debug,
    })
}

fn log_parameters(config: &WorkerConfig) {
    info!(
        panda_id = config.job.panda_id,
        task_id = config.job.task_id,
        phase = config.phase.as_str(),
        libraries = ?config.payload.libraries,
        script = ?config.payload.script,
        job_params = %config.payload.job_params,
        input_files = ?config.inputs.files,
        in_map = ?config.inputs.streams,
        direct_in = config.inputs.direct_access,
        write_input_to_txt = ?config.inputs.write_to_file,
        archive = ?config.payload.archive,
        output_file = %config.output_file,
        in_sample_file = %config.in_sample_file,
        run_dir = %config.run_dir.display(),
        panda_url = %config.endpoints.panda_url,
        idds_url = %config.endpoints.idds_url,
        source_url = %config.endpoints.source_url,
        cert = %config.credentials.cert.display(),
        debug = config.debug,
        "parameters"
    );
}

fn parse_string_list(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value = python_literal_to_json(raw)?;
    serde_json::from_value(value).map_err(|e| anyhow!("expected a list of strings: {}", e))
}

fn parse_stream_map(raw: &str) -> Result<BTreeMap<String, Vec<String>>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let value = python_literal_to_json(raw)?;
    serde_json::from_value(value)
        .map_err(|e| anyhow!("expected a mapping of stream to list of strings: {}", e))
}

/// Rewrites a Python literal made of strings, lists, tuples and dicts as JSON.
fn python_literal_to_json(raw: &str) -> Result<Value> {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        bail!("unterminated string in {}", raw);
                    };
                    i += 1;
                    if ch == '\\' {
                        if let Some(&escaped) = chars.get(i) {
                            s.push(escaped);
                            i += 1;
                        }
                        continue;
                    }
                    if ch == c {
                        break;
                    }
                    s.push(ch);
                }
                out.push_str(&serde_json::to_string(&s)?);
                continue;
            }
            'u' | 'b' | 'r' if matches!(chars.get(i + 1), Some('\'') | Some('"')) => {}
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some(']') | Some('}') | Some(')')) {
                    out.push(',');
                }
            }
            '(' => out.push('['),
            ')' => out.push(']'),
            _ => out.push(c),
        }
        i += 1;
    }
    serde_json::from_str(&out).map_err(|e| anyhow!("cannot parse '{}': {}", raw, e))
}
