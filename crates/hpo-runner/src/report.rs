use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use crate::client::{EventStatus, JobScheduler, SampleCoordinator};
use crate::context::RunContext;

/// The payload's declared output artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionOutcome {
    pub status: i64,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LossUnavailable {
    Missing,
    Malformed(String),
    Failed { status: i64, error: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Loss recorded and event range acknowledged.
    Reported { loss: f64 },
    /// No usable loss; nothing was sent.
    NoLoss(LossUnavailable),
    /// The coordinator refused the loss; the event range stays open.
    ReportFailed { loss: f64, error: String },
    /// Loss recorded but the acknowledgement failed.
    AcknowledgeFailed { loss: f64, error: String },
}

/// Reads the loss out of the output artifact at `path`.
pub fn read_loss(path: &Path) -> Result<f64, LossUnavailable> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LossUnavailable::Missing)
        }
        Err(e) => return Err(LossUnavailable::Malformed(e.to_string())),
    };
    info!(path = %path.display(), content = %String::from_utf8_lossy(&bytes).trim_end(), "output artifact");
    let outcome: ExecutionOutcome = serde_json::from_slice(&bytes)
        .map_err(|e| LossUnavailable::Malformed(e.to_string()))?;
    if outcome.status != 0 {
        return Err(LossUnavailable::Failed {
            status: outcome.status,
            error: outcome.error,
        });
    }
    outcome
        .loss
        .ok_or_else(|| LossUnavailable::Malformed("status 0 without loss".to_string()))
}

/// Records the loss with the coordinator, then and only then acknowledges
/// the event range. Never fails the process.
pub fn report_result(
    context: &RunContext,
    output_path: &Path,
    scheduler: &dyn JobScheduler,
    coordinator: &dyn SampleCoordinator,
) -> ReportOutcome {
    let loss = match read_loss(output_path) {
        Ok(loss) => loss,
        Err(reason) => {
            match &reason {
                LossUnavailable::Missing => {
                    warn!(path = %output_path.display(), "output artifact doesn't exist")
                }
                LossUnavailable::Malformed(msg) => {
                    error!(error = %msg, "failed to get loss")
                }
                LossUnavailable::Failed { status, error } => error!(
                    status,
                    error = error.as_deref().unwrap_or(""),
                    "failed to evaluate"
                ),
            }
            return ReportOutcome::NoLoss(reason);
        }
    };
    info!(sample_id = %context.sample_id, loss, "got loss");

    if let Err(e) = coordinator.report_loss(context.task_id, &context.sample_id, loss) {
        error!(sample_id = %context.sample_id, error = %e, "failed to report loss");
        return ReportOutcome::ReportFailed {
            loss,
            error: e.to_string(),
        };
    }
    info!(sample_id = %context.sample_id, "loss reported");

    match scheduler.acknowledge_event(&context.event_range_id, EventStatus::Finished) {
        Ok(()) => {
            info!(event_range_id = %context.event_range_id, "event range finished");
            ReportOutcome::Reported { loss }
        }
        Err(e) => {
            error!(event_range_id = %context.event_range_id, error = %e, "failed to update event range");
            ReportOutcome::AcknowledgeFailed {
                loss,
                error: e.to_string(),
            }
        }
    }
}
