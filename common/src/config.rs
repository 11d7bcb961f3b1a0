use serde::{Deserialize, Serialize};

/// Update endpoint baked in at build time, if one was provided.
pub const BUILD_FIRMWARE_URL: Option<&str> = option_env!("CLOCK_OTA_URL");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub firmware_url: String,
    pub startup_grace_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retries: u8,
    pub cooldown_ms: u64,
    pub chunk_size: usize,
    pub read_timeout_ms: u64,
    /// When set, the task keeps checking for updates at this interval
    /// instead of ending after the first conclusive check.
    pub recheck_interval_ms: Option<u64>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            firmware_url: BUILD_FIRMWARE_URL.unwrap_or_default().to_string(),
            startup_grace_ms: 10_000,
            retry_interval_ms: 10_000,
            max_retries: 3,
            cooldown_ms: 300_000,
            chunk_size: 4096,
            read_timeout_ms: 30_000,
            recheck_interval_ms: None,
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        self.firmware_url = self.firmware_url.trim().to_string();
        self.max_retries = self.max_retries.clamp(1, 10);
        self.retry_interval_ms = self.retry_interval_ms.clamp(1_000, 600_000);
        self.cooldown_ms = self.cooldown_ms.max(self.retry_interval_ms);
        self.chunk_size = self.chunk_size.clamp(256, 16 * 1024);
        self.read_timeout_ms = self.read_timeout_ms.clamp(1_000, 120_000);
        if let Some(interval) = self.recheck_interval_ms.as_mut() {
            *interval = (*interval).max(60_000);
        }
    }

    pub fn has_update_url(&self) -> bool {
        ["https://", "http://", "file://"]
            .iter()
            .any(|scheme| self.firmware_url.starts_with(scheme))
    }
}
