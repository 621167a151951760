//! Blocking clients for the job scheduler (PanDA) and the sample
//! coordinator (iDDS).
//!
//! Every call returns a `Result` value; nothing here panics or retries.
//! Retry policy belongs to the caller.

use reqwest::blocking::{Client, Response};
use reqwest::header::ACCEPT;
use reqwest::{Certificate, Identity};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Credentials, JobIdentity};
use crate::error::RemoteError;
use crate::event::EventRange;

const USER_AGENT: &str = concat!("runhpo/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Finished,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Finished => "finished",
        }
    }
}

/// A hyperparameter sample. `loss == None` means not yet evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub parameters: Value,
    pub loss: Option<f64>,
}

pub trait JobScheduler {
    /// An empty vector is the normal "no work available" answer.
    fn fetch_event_ranges(
        &self,
        job: JobIdentity,
        n_ranges: u32,
    ) -> Result<Vec<EventRange>, RemoteError>;

    fn acknowledge_event(&self, event_range_id: &str, status: EventStatus)
        -> Result<(), RemoteError>;
}

pub trait SampleCoordinator {
    fn fetch_sample(&self, task_id: i64, sample_id: &str) -> Result<Sample, RemoteError>;

    fn report_loss(&self, task_id: i64, sample_id: &str, loss: f64) -> Result<(), RemoteError>;
}

pub trait ArchiveFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), RemoteError>;
}

/// Shared HTTP client carrying the grid proxy as client identity.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(credentials: &Credentials) -> Result<Self, RemoteError> {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(identity) = load_identity(credentials)? {
            builder = builder.identity(identity);
        }
        if let Some(dir) = &credentials.ca_dir {
            for cert in load_ca_certificates(dir) {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

fn read_pem(path: &Path) -> Result<Option<Vec<u8>>, RemoteError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RemoteError::Credentials {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn load_identity(credentials: &Credentials) -> Result<Option<Identity>, RemoteError> {
    let Some(mut pem) = read_pem(&credentials.cert)? else {
        warn!(
            cert = %credentials.cert.display(),
            "client certificate not found; continuing without client identity"
        );
        return Ok(None);
    };
    if credentials.key != credentials.cert {
        match read_pem(&credentials.key)? {
            Some(key) => {
                pem.push(b'\n');
                pem.extend_from_slice(&key);
            }
            None => {
                warn!(key = %credentials.key.display(), "client key not found");
                return Ok(None);
            }
        }
    }
    Ok(Some(Identity::from_pem(&pem)?))
}

fn load_ca_certificates(dir: &Path) -> Vec<Certificate> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("pem"))
        .filter_map(|e| {
            let bytes = fs::read(e.path()).ok()?;
            match Certificate::from_pem(&bytes) {
                Ok(cert) => Some(cert),
                Err(err) => {
                    debug!(path = %e.path().display(), error = %err, "skipping CA file");
                    None
                }
            }
        })
        .collect()
}

fn success_body(response: Response) -> Result<String, RemoteError> {
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(RemoteError::Status {
            status: status.as_u16(),
            body: truncate(&body),
        });
    }
    Ok(body)
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_ERROR_BODY {
        return s.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

impl ArchiveFetcher for HttpTransport {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        let bytes = response.bytes()?;
        fs::write(dest, &bytes)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PandaReply {
    #[serde(rename = "StatusCode", default)]
    status_code: i64,
    #[serde(rename = "eventRanges", default)]
    event_ranges: Option<Vec<EventRange>>,
}

fn decode_panda_reply(body: &str) -> Result<PandaReply, RemoteError> {
    let reply: PandaReply = serde_json::from_str(body)
        .map_err(|e| RemoteError::Malformed(format!("{}: {}", e, truncate(body))))?;
    if reply.status_code != 0 {
        return Err(RemoteError::Rejected {
            code: reply.status_code,
            message: truncate(body),
        });
    }
    Ok(reply)
}

pub struct PandaClient {
    transport: HttpTransport,
    base_url: String,
}

impl PandaClient {
    pub fn new(transport: HttpTransport, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl JobScheduler for PandaClient {
    fn fetch_event_ranges(
        &self,
        job: JobIdentity,
        n_ranges: u32,
    ) -> Result<Vec<EventRange>, RemoteError> {
        let url = format!("{}/server/panda/getEventRanges", self.base_url);
        let form = [
            ("pandaID", job.panda_id.to_string()),
            ("jobsetID", "0".to_string()),
            ("taskID", job.task_id.to_string()),
            ("nRanges", n_ranges.to_string()),
        ];
        let response = self
            .transport
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()?;
        let body = success_body(response)?;
        debug!(body = %truncate(&body), "getEventRanges reply");
        decode_panda_reply(&body)?
            .event_ranges
            .ok_or_else(|| RemoteError::Malformed("reply has no eventRanges".to_string()))
    }

    fn acknowledge_event(
        &self,
        event_range_id: &str,
        status: EventStatus,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/server/panda/updateEventRanges", self.base_url);
        let ranges = json!([{ "eventRangeID": event_range_id, "eventStatus": status.as_str() }]);
        let form = [("eventRanges", ranges.to_string())];
        let response = self
            .transport
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()?;
        let body = success_body(response)?;
        debug!(body = %truncate(&body), "updateEventRanges reply");
        decode_panda_reply(&body).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct SampleRecord {
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    loss: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleReply {
    Many(Vec<SampleRecord>),
    One(SampleRecord),
}

pub struct IddsClient {
    transport: HttpTransport,
    base_url: String,
}

impl IddsClient {
    pub fn new(transport: HttpTransport, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn sample_url(&self, task_id: i64, sample_id: &str) -> String {
        format!("{}/idds/hpo/null/{}/{}", self.base_url, task_id, sample_id)
    }
}

impl SampleCoordinator for IddsClient {
    fn fetch_sample(&self, task_id: i64, sample_id: &str) -> Result<Sample, RemoteError> {
        let url = format!("{}/null/null", self.sample_url(task_id, sample_id));
        let response = self
            .transport
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()?;
        let body = success_body(response)?;
        let reply: SampleReply = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Malformed(format!("{}: {}", e, truncate(&body))))?;
        let record = match reply {
            SampleReply::One(record) => record,
            SampleReply::Many(records) => records.into_iter().next().ok_or_else(|| {
                RemoteError::NotFound(format!("sample {} of task {}", sample_id, task_id))
            })?,
        };
        let parameters = record
            .parameters
            .ok_or_else(|| RemoteError::Malformed("sample has no parameters".to_string()))?;
        Ok(Sample {
            parameters,
            loss: record.loss,
        })
    }

    fn report_loss(&self, task_id: i64, sample_id: &str, loss: f64) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.sample_url(task_id, sample_id), loss);
        let response = self
            .transport
            .client
            .put(&url)
            .header(ACCEPT, "application/json")
            .send()?;
        success_body(response).map(|_| ())
    }
}
