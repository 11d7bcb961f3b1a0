use std::{thread, time::Duration};

use log::{error, info, warn};
use thiserror::Error;

use crate::{
    boot::{validate_boot, BootValidation},
    config::OtaConfig,
    engine::{ApplyOutcome, FirmwareSource, SystemReset, UpdateEngine},
    gate::{RetryCounter, RetryDecision, RetryPolicy},
    identity::{identify_running, IdentityError, RunningImage},
    partition::PartitionTable,
    signal::NetworkSignal,
    status::{OtaPhase, OtaStatusHandle, PENDING_VERSION},
    store::{KvStore, TrustStore},
};

const NETWORK_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub trait Delay {
    fn delay(&self, duration: Duration);
}

/// Blocks the calling thread.
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Why the task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// No update endpoint configured; boot validation still ran.
    NoUpdateUrl,
    UpToDate,
    /// The server answered with something that is not an app image.
    NoUpdateAvailable,
    /// A new image was committed and a restart requested.
    Restarted { version: String },
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub running: RunningImage,
    pub boot: BootValidation,
    pub exit: TaskExit,
}

/// Hardware and network collaborators the task drives.
pub struct OtaPlatform<T, K, S, R, D> {
    pub table: T,
    pub kv: K,
    pub source: S,
    pub reset: R,
    pub delay: D,
}

/// Boot validation followed by the update check loop. Runs once per boot on
/// its own thread and never blocks the display.
pub struct OtaTask<T, K, S, R, D> {
    config: OtaConfig,
    platform: OtaPlatform<T, K, S, R, D>,
    network: NetworkSignal,
    status: OtaStatusHandle,
}

impl<T, K, S, R, D> OtaTask<T, K, S, R, D>
where
    T: PartitionTable,
    K: KvStore,
    S: FirmwareSource,
    R: SystemReset,
    D: Delay,
{
    pub fn new(
        config: OtaConfig,
        platform: OtaPlatform<T, K, S, R, D>,
        network: NetworkSignal,
        status: OtaStatusHandle,
    ) -> Self {
        Self {
            config,
            platform,
            network,
            status,
        }
    }

    pub fn table(&self) -> &T {
        &self.platform.table
    }

    pub fn into_platform(self) -> OtaPlatform<T, K, S, R, D> {
        self.platform
    }

    pub fn run(&mut self) -> Result<TaskSummary, TaskError> {
        let running = match identify_running(&self.platform.table) {
            Ok(running) => running,
            Err(err) => {
                error!("{err}");
                self.status.set_phase(OtaPhase::Failed);
                return Err(err.into());
            }
        };
        self.status.set_running(&running);

        self.wait_for_network();
        info!(
            "network up; checking firmware in {}s",
            self.config.startup_grace_ms / 1000
        );
        self.platform
            .delay
            .delay(Duration::from_millis(self.config.startup_grace_ms));

        self.status.set_phase(OtaPhase::Validating);
        let mut trust = TrustStore::open(&self.platform.kv);
        let boot = validate_boot(&mut self.platform.table, &mut trust, &running);
        info!("boot validation: {boot:?}");
        self.status.set_boot_validation(&boot);

        if !self.config.has_update_url() {
            warn!("no firmware update URL configured; skipping update check");
            self.status.set_phase(OtaPhase::Finished);
            return Ok(TaskSummary {
                running,
                boot,
                exit: TaskExit::NoUpdateUrl,
            });
        }

        let exit = self.check_loop(&running, &mut trust);
        Ok(TaskSummary {
            running,
            boot,
            exit,
        })
    }

    fn check_loop(
        &mut self,
        running: &RunningImage,
        trust: &mut TrustStore<K::Namespace>,
    ) -> TaskExit {
        let engine = UpdateEngine::new(self.config.chunk_size);
        let mut retries = RetryCounter::new(RetryPolicy::from_config(&self.config));
        let running_version = running.version().unwrap_or(PENDING_VERSION).to_string();

        loop {
            self.wait_for_network();
            self.status.set_phase(OtaPhase::Checking);
            info!("checking {} for firmware", self.config.firmware_url);

            let result = engine.apply(
                &self.config.firmware_url,
                &running_version,
                &mut self.platform.table,
                &mut self.platform.source,
                trust,
                &self.platform.reset,
                &self.status,
            );

            let exit = match result {
                Ok(ApplyOutcome::Restarted { version, .. }) => {
                    return TaskExit::Restarted { version };
                }
                Ok(ApplyOutcome::UpToDate { .. }) => {
                    retries.record_success();
                    self.status.record_check(None, 0);
                    TaskExit::UpToDate
                }
                Err(err) if !err.is_retryable() => {
                    warn!("no usable update available: {err}");
                    retries.record_success();
                    self.status.record_check(Some(err.to_string()), 0);
                    TaskExit::NoUpdateAvailable
                }
                Err(err) => {
                    let decision = retries.record_failure();
                    self.status
                        .record_check(Some(err.to_string()), retries.count());
                    self.status.set_phase(match decision {
                        RetryDecision::RetryAfter(_) => OtaPhase::RetryWait,
                        RetryDecision::Cooldown(_) => OtaPhase::Cooldown,
                    });
                    self.platform.delay.delay(decision.delay());
                    continue;
                }
            };

            let Some(recheck_ms) = self.config.recheck_interval_ms else {
                self.status.set_phase(OtaPhase::Finished);
                return exit;
            };
            info!("next firmware check in {}s", recheck_ms / 1000);
            self.status.set_phase(OtaPhase::Idle);
            self.platform.delay.delay(Duration::from_millis(recheck_ms));
        }
    }

    fn wait_for_network(&self) {
        if self.network.is_connected() {
            return;
        }
        info!("waiting for network");
        self.status.set_phase(OtaPhase::WaitingForNetwork);
        while !self.network.wait_connected_timeout(NETWORK_WAIT_LOG_INTERVAL) {
            info!("still waiting for network");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        digest::FirmwareDigest,
        partition::{ImageValidationState, PartitionRole},
        sim::{
            build_image, MemoryKvStore, RecordingDelay, RecordingReset, SimFlash, SimSource,
        },
        store::{NVS_FIRMWARE_HASH_KEY, NVS_NAMESPACE},
    };

    type SimTask<D> = OtaTask<SimFlash, MemoryKvStore, SimSource, RecordingReset, D>;

    fn config() -> OtaConfig {
        OtaConfig {
            firmware_url: "https://updates.example.com/clock.bin".to_string(),
            ..OtaConfig::default()
        }
    }

    fn connected() -> NetworkSignal {
        let network = NetworkSignal::new();
        network.set_connected(true);
        network
    }

    fn task<D: Delay>(
        config: OtaConfig,
        flash: SimFlash,
        kv: &MemoryKvStore,
        source: &SimSource,
        reset: &RecordingReset,
        delay: D,
    ) -> SimTask<D> {
        OtaTask::new(
            config,
            OtaPlatform {
                table: flash,
                kv: kv.clone(),
                source: source.clone(),
                reset: reset.clone(),
                delay,
            },
            connected(),
            OtaStatusHandle::new(),
        )
    }

    /// Runs the callback with the number of delays seen so far.
    struct ScriptedDelay<F> {
        recorded: RecordingDelay,
        calls: AtomicUsize,
        on_delay: F,
    }

    impl<F: Fn(usize)> ScriptedDelay<F> {
        fn new(on_delay: F) -> Self {
            Self {
                recorded: RecordingDelay::default(),
                calls: AtomicUsize::new(0),
                on_delay,
            }
        }
    }

    impl<F: Fn(usize)> Delay for ScriptedDelay<F> {
        fn delay(&self, duration: Duration) {
            self.recorded.delay(duration);
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.on_delay)(calls);
        }
    }

    #[test]
    fn first_factory_boot_without_update_anchors_and_finishes() {
        let factory = build_image("1.0.0", 4096);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(factory.clone());
        let reset = RecordingReset::default();
        let delay = RecordingDelay::default();
        let mut task = task(
            config(),
            SimFlash::new(factory.clone(), 2),
            &kv,
            &source,
            &reset,
            delay.clone(),
        );

        let summary = task.run().unwrap();

        assert_eq!(summary.boot, BootValidation::FactoryAnchored);
        assert_eq!(summary.exit, TaskExit::UpToDate);
        assert_eq!(
            kv.committed(NVS_NAMESPACE, NVS_FIRMWARE_HASH_KEY),
            Some(FirmwareDigest::of_bytes(&factory).as_bytes().to_vec())
        );
        assert_eq!(delay.delays(), vec![Duration::from_secs(10)]);
        assert_eq!(reset.count(), 0);
    }

    #[test]
    fn failed_checks_retry_then_cool_down() {
        let factory = build_image("1.0.0", 4096);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(factory.clone());
        source.fail_next_connects(3);
        let reset = RecordingReset::default();
        let delay = RecordingDelay::default();
        let mut task = task(
            config(),
            SimFlash::new(factory, 2),
            &kv,
            &source,
            &reset,
            delay.clone(),
        );

        let summary = task.run().unwrap();

        assert_eq!(summary.exit, TaskExit::UpToDate);
        assert_eq!(
            delay.delays(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(300),
            ]
        );
        assert_eq!(source.open_count(), 1);
        assert_eq!(task.status.snapshot().retry_count, 0);
        assert_eq!(task.status.snapshot().phase, OtaPhase::Finished);
    }

    #[test]
    fn update_then_confirm_on_next_boot() {
        let kv = MemoryKvStore::default();
        let release = build_image("1.1.0", 6000);
        let source = SimSource::new(release.clone());
        let reset = RecordingReset::default();

        let mut first = task(
            config(),
            SimFlash::new(build_image("1.0.0", 4096), 2),
            &kv,
            &source,
            &reset,
            RecordingDelay::default(),
        );
        let summary = first.run().unwrap();
        assert_eq!(
            summary.exit,
            TaskExit::Restarted {
                version: "1.1.0".to_string()
            }
        );
        assert_eq!(reset.count(), 1);
        assert_eq!(first.status.snapshot().phase, OtaPhase::Restarting);

        let mut flash = first.into_platform().table;
        flash.reboot();

        let mut second = task(
            config(),
            flash,
            &kv,
            &source,
            &reset,
            RecordingDelay::default(),
        );
        let summary = second.run().unwrap();

        assert_eq!(summary.running.role(), PartitionRole::OtaSlot(0));
        assert_eq!(
            summary.boot,
            BootValidation::MarkedValid {
                previous_erased: false
            }
        );
        assert_eq!(summary.exit, TaskExit::UpToDate);
        assert_eq!(second.status.running_version(), "1.1.0");
        assert_eq!(
            second
                .table()
                .validation_state(&summary.running.partition)
                .unwrap(),
            Some(ImageValidationState::Valid)
        );
        assert_eq!(reset.count(), 1);
    }

    #[test]
    fn failed_update_leaves_confirmed_slot_valid() {
        let current = build_image("1.1.0", 4096);
        let mut flash = SimFlash::new(build_image("1.0.0", 4096), 2);
        flash.install(0, &current).unwrap();
        flash.reboot();
        flash.mark_running_valid().unwrap();

        let kv = MemoryKvStore::default();
        let source = SimSource::new(build_image("1.2.0", 20_000));
        source.truncate_at(9_000);
        let reset = RecordingReset::default();
        let heal = {
            let source = source.clone();
            let current = current.clone();
            move |calls: usize| {
                // grace period, then two failed attempts
                if calls == 3 {
                    source.clear_faults();
                    source.set_image(current.clone());
                }
            }
        };
        let mut task = task(config(), flash, &kv, &source, &reset, ScriptedDelay::new(heal));

        let summary = task.run().unwrap();

        assert_eq!(summary.exit, TaskExit::UpToDate);
        let running = task.table().running().unwrap();
        assert_eq!(running.label, "ota_0");
        assert_eq!(task.table().boot_target().unwrap(), running);
        assert_eq!(
            task.table().validation_state(&running).unwrap(),
            Some(ImageValidationState::Valid)
        );
        assert!(task.table().image("ota_1").unwrap().is_empty());
        assert_eq!(task.table().abort_calls(), 2);
        assert_eq!(reset.count(), 0);
    }

    #[test]
    fn recheck_interval_picks_up_a_later_release() {
        let factory = build_image("1.0.0", 4096);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(factory.clone());
        let reset = RecordingReset::default();
        let release = {
            let source = source.clone();
            move |calls: usize| {
                if calls == 2 {
                    source.set_image(build_image("1.1.0", 4096));
                }
            }
        };
        let config = OtaConfig {
            recheck_interval_ms: Some(3_600_000),
            ..config()
        };
        let delay = ScriptedDelay::new(release);
        let mut task = task(config, SimFlash::new(factory, 2), &kv, &source, &reset, delay);

        let summary = task.run().unwrap();

        assert_eq!(
            summary.exit,
            TaskExit::Restarted {
                version: "1.1.0".to_string()
            }
        );
        assert_eq!(source.open_count(), 2);
        assert_eq!(reset.count(), 1);
    }

    #[test]
    fn garbage_from_server_is_not_retried() {
        let factory = build_image("1.0.0", 4096);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(vec![0xff; 4096]);
        let reset = RecordingReset::default();
        let delay = RecordingDelay::default();
        let mut task = task(
            config(),
            SimFlash::new(factory, 2),
            &kv,
            &source,
            &reset,
            delay.clone(),
        );

        let summary = task.run().unwrap();

        assert_eq!(summary.exit, TaskExit::NoUpdateAvailable);
        assert_eq!(source.open_count(), 1);
        assert_eq!(delay.delays().len(), 1);
        assert!(task.status.snapshot().last_error.is_some());
    }

    #[test]
    fn missing_url_still_validates_boot() {
        let kv = MemoryKvStore::default();
        let source = SimSource::new(Vec::new());
        let reset = RecordingReset::default();
        let config = OtaConfig {
            firmware_url: String::new(),
            ..OtaConfig::default()
        };
        let mut task = task(
            config,
            SimFlash::new(build_image("1.0.0", 4096), 2),
            &kv,
            &source,
            &reset,
            RecordingDelay::default(),
        );

        let summary = task.run().unwrap();

        assert_eq!(summary.exit, TaskExit::NoUpdateUrl);
        assert_eq!(summary.boot, BootValidation::FactoryAnchored);
        assert_eq!(source.open_count(), 0);
    }

    #[test]
    fn unreadable_running_image_stops_before_touching_anything() {
        let mut flash = SimFlash::new(build_image("1.0.0", 4096), 2);
        flash.set_unreadable("factory", true);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(build_image("1.1.0", 4096));
        let reset = RecordingReset::default();
        let mut task = task(
            config(),
            flash,
            &kv,
            &source,
            &reset,
            RecordingDelay::default(),
        );

        assert!(matches!(task.run(), Err(TaskError::Identity(_))));
        assert_eq!(kv.commit_count(), 0);
        assert_eq!(source.open_count(), 0);
        assert_eq!(task.status.snapshot().phase, OtaPhase::Failed);
    }

    #[test]
    fn waits_for_network_before_validating() {
        let factory = build_image("1.0.0", 4096);
        let kv = MemoryKvStore::default();
        let source = SimSource::new(factory.clone());
        let reset = RecordingReset::default();
        let network = NetworkSignal::new();
        let status = OtaStatusHandle::new();
        let mut task = OtaTask::new(
            config(),
            OtaPlatform {
                table: SimFlash::new(factory, 2),
                kv: kv.clone(),
                source: source.clone(),
                reset,
                delay: RecordingDelay::default(),
            },
            network.clone(),
            status.clone(),
        );

        let worker = std::thread::spawn(move || task.run().map(|summary| summary.exit));
        while status.snapshot().phase != OtaPhase::WaitingForNetwork {
            std::thread::yield_now();
        }
        assert_eq!(kv.commit_count(), 0);

        network.set_connected(true);
        let exit = worker.join().unwrap().unwrap();

        assert_eq!(exit, TaskExit::UpToDate);
        assert_eq!(kv.commit_count(), 1);
    }
}
