use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::{boot::BootValidation, identity::RunningImage};

/// Version reported before the running image has been identified.
pub const PENDING_VERSION: &str = "Pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaPhase {
    Starting,
    WaitingForNetwork,
    Validating,
    Checking,
    Downloading,
    RetryWait,
    Cooldown,
    Idle,
    Restarting,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    #[serde(rename = "runningVersion")]
    pub running_version: String,
    #[serde(rename = "runningSha256")]
    pub running_sha256: Option<String>,
    #[serde(rename = "runningPartition")]
    pub running_partition: Option<String>,
    #[serde(rename = "bootValidation")]
    pub boot_validation: Option<String>,
    pub phase: OtaPhase,
    #[serde(rename = "candidateVersion")]
    pub candidate_version: Option<String>,
    #[serde(rename = "bytesReceived")]
    pub bytes_received: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "retryCount")]
    pub retry_count: u8,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastCheckEpoch")]
    pub last_check_epoch: Option<i64>,
}

impl Default for OtaStatus {
    fn default() -> Self {
        Self {
            running_version: PENDING_VERSION.to_string(),
            running_sha256: None,
            running_partition: None,
            boot_validation: None,
            phase: OtaPhase::Starting,
            candidate_version: None,
            bytes_received: 0,
            total_bytes: None,
            progress_pct: None,
            retry_count: 0,
            last_error: None,
            last_check_epoch: None,
        }
    }
}

/// Shared OTA status. The OTA task is the only writer; the status page and
/// anything else read copies through [`OtaStatusHandle::snapshot`].
#[derive(Clone, Default)]
pub struct OtaStatusHandle {
    inner: Arc<Mutex<OtaStatus>>,
}

impl OtaStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OtaStatus {
        self.lock().clone()
    }

    pub fn running_version(&self) -> String {
        self.lock().running_version.clone()
    }

    pub(crate) fn set_running(&self, running: &RunningImage) {
        let mut status = self.lock();
        status.running_version = running.version().unwrap_or(PENDING_VERSION).to_string();
        status.running_sha256 = Some(running.digest.to_hex());
        status.running_partition = Some(running.partition.label.clone());
    }

    pub(crate) fn set_boot_validation(&self, outcome: &BootValidation) {
        self.lock().boot_validation = Some(format!("{outcome:?}"));
    }

    pub(crate) fn set_phase(&self, phase: OtaPhase) {
        self.lock().phase = phase;
    }

    pub(crate) fn begin_download(&self, candidate_version: &str, total_bytes: Option<u64>) {
        let mut status = self.lock();
        status.phase = OtaPhase::Downloading;
        status.candidate_version = Some(candidate_version.to_string());
        status.bytes_received = 0;
        status.total_bytes = total_bytes;
        status.progress_pct = total_bytes.map(|_| 0);
    }

    pub(crate) fn record_progress(&self, bytes_received: u64) {
        let mut status = self.lock();
        status.bytes_received = bytes_received;
        if let Some(total) = status.total_bytes.filter(|value| *value > 0) {
            let pct = (bytes_received.saturating_mul(100) / total).min(100);
            status.progress_pct = Some(pct as u8);
        }
    }

    pub(crate) fn record_check(&self, error: Option<String>, retry_count: u8) {
        let mut status = self.lock();
        status.last_error = error;
        status.retry_count = retry_count;
        status.last_check_epoch = Some(chrono::Utc::now().timestamp());
    }

    fn lock(&self) -> MutexGuard<'_, OtaStatus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
