//! In-memory stand-ins for the flash, NVS and HTTP collaborators. The host
//! build runs the OTA task against these, optionally persisted to a
//! directory so restarts behave like a power cycle.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::ImageDescriptor,
    digest::FirmwareDigest,
    engine::{FetchError, FirmwareSource, ImageStream, SystemReset},
    partition::{
        FirmwareWriter, ImageValidationState, PartitionError, PartitionInfo, PartitionRole,
        PartitionTable,
    },
    store::{KvNamespace, KvStore, StoreError},
    task::Delay,
};

const FACTORY_LABEL: &str = "factory";
const FACTORY_ADDRESS: u32 = 0x1_0000;
const APP_PARTITION_SIZE: u32 = 0x18_0000;
const OTADATA_FILE: &str = "otadata.json";
/// Largest chunk a simulated HTTP read returns, roughly one TCP segment.
const STREAM_SEGMENT: usize = 1500;

/// A well-formed app image: descriptor prefix followed by a body derived
/// from the version, so different versions hash differently.
pub fn build_image(version: &str, len: usize) -> Vec<u8> {
    let descriptor = ImageDescriptor {
        version: version.to_string(),
        project_name: "smart-clock".to_string(),
        secure_version: 0,
        build_time: "00:00:00".to_string(),
        build_date: "Jan  1 2026".to_string(),
        idf_version: "v5.3.2".to_string(),
    };

    let mut image = descriptor.encode_prefix().to_vec();
    let start = image.len();
    let seed = version
        .bytes()
        .fold(17_u8, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte));
    image.extend((start..len.max(start)).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)));
    image
}

struct SimPartition {
    info: PartitionInfo,
    image: Vec<u8>,
    state: Option<ImageValidationState>,
    unreadable: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtaData {
    running: String,
    boot: String,
    last_boot: Option<String>,
    states: HashMap<String, ImageValidationState>,
}

/// Factory partition plus N OTA slots with a bootloader that follows the
/// ESP-IDF rollback rules: a `New` slot boots once as `PendingVerify`, and
/// a slot still pending at the next boot is marked `Invalid` and abandoned.
pub struct SimFlash {
    partitions: Vec<SimPartition>,
    running: usize,
    boot: usize,
    last_boot: Option<usize>,
    fail_writes_after: Option<u64>,
    fail_complete: bool,
    fail_mark_valid: bool,
    mark_valid_calls: usize,
    erase_calls: usize,
    abort_calls: usize,
    begin_update_calls: usize,
    backing_dir: Option<PathBuf>,
}

impl SimFlash {
    pub fn new(factory_image: Vec<u8>, slots: u8) -> Self {
        let mut partitions = vec![SimPartition {
            info: PartitionInfo {
                label: FACTORY_LABEL.to_string(),
                role: PartitionRole::Factory,
                address: FACTORY_ADDRESS,
                size: APP_PARTITION_SIZE,
            },
            image: factory_image,
            state: None,
            unreadable: false,
        }];
        for slot in 0..slots {
            partitions.push(SimPartition {
                info: PartitionInfo {
                    label: format!("ota_{slot}"),
                    role: PartitionRole::OtaSlot(slot),
                    address: FACTORY_ADDRESS + APP_PARTITION_SIZE * (u32::from(slot) + 1),
                    size: APP_PARTITION_SIZE,
                },
                image: Vec::new(),
                state: None,
                unreadable: false,
            });
        }

        Self {
            partitions,
            running: 0,
            boot: 0,
            last_boot: None,
            fail_writes_after: None,
            fail_complete: false,
            fail_mark_valid: false,
            mark_valid_calls: 0,
            erase_calls: 0,
            abort_calls: 0,
            begin_update_calls: 0,
            backing_dir: None,
        }
    }

    /// Loads partition images and OTA data from `dir`, seeding the factory
    /// partition with `factory_image` on first use. Every later mutation is
    /// written back.
    pub fn open_dir(
        dir: impl Into<PathBuf>,
        factory_image: Vec<u8>,
        slots: u8,
    ) -> Result<Self, PartitionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| PartitionError::platform("create flash dir", err))?;

        let mut flash = Self::new(factory_image, slots);
        for partition in &mut flash.partitions {
            let path = dir.join(format!("{}.bin", partition.info.label));
            match fs::read(&path) {
                Ok(image) => partition.image = image,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(PartitionError::platform("read flash image", err)),
            }
        }

        let otadata = dir.join(OTADATA_FILE);
        if otadata.exists() {
            let raw =
                fs::read(&otadata).map_err(|err| PartitionError::platform("read otadata", err))?;
            let data: OtaData = serde_json::from_slice(&raw)
                .map_err(|err| PartitionError::platform("parse otadata", err))?;
            flash.apply_otadata(data);
        }

        flash.backing_dir = Some(dir);
        flash.persist()?;
        Ok(flash)
    }

    fn apply_otadata(&mut self, data: OtaData) {
        if let Some(index) = self.index_of(&data.running) {
            self.running = index;
        }
        if let Some(index) = self.index_of(&data.boot) {
            self.boot = index;
        }
        self.last_boot = data.last_boot.as_deref().and_then(|label| self.index_of(label));
        for partition in &mut self.partitions {
            partition.state = data.states.get(&partition.info.label).copied();
        }
    }

    fn persist(&self) -> Result<(), PartitionError> {
        let Some(dir) = self.backing_dir.as_deref() else {
            return Ok(());
        };

        for partition in &self.partitions {
            write_atomic(
                &dir.join(format!("{}.bin", partition.info.label)),
                &partition.image,
            )?;
        }

        let data = OtaData {
            running: self.partitions[self.running].info.label.clone(),
            boot: self.partitions[self.boot].info.label.clone(),
            last_boot: self
                .last_boot
                .map(|index| self.partitions[index].info.label.clone()),
            states: self
                .partitions
                .iter()
                .filter_map(|p| p.state.map(|state| (p.info.label.clone(), state)))
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&data)
            .map_err(|err| PartitionError::platform("encode otadata", err))?;
        write_atomic(&dir.join(OTADATA_FILE), &raw)
    }

    fn persist_logged(&self) {
        if let Err(err) = self.persist() {
            warn!("failed to persist simulated flash: {err}");
        }
    }

    /// Simulated bootloader pass.
    pub fn reboot(&mut self) {
        let previous = self.running;
        let target = self.boot;

        match self.partitions[target].state {
            Some(ImageValidationState::New) => {
                self.partitions[target].state = Some(ImageValidationState::PendingVerify);
                self.running = target;
            }
            Some(ImageValidationState::PendingVerify | ImageValidationState::Invalid) => {
                self.partitions[target].state = Some(ImageValidationState::Invalid);
                let fallback = self.fallback_for(target);
                info!(
                    "bootloader: `{}` was never confirmed; rolling back to `{}`",
                    self.partitions[target].info.label, self.partitions[fallback].info.label
                );
                self.boot = fallback;
                self.running = fallback;
            }
            Some(ImageValidationState::Valid) | None => self.running = target,
        }

        if self.running != previous {
            self.last_boot = Some(previous);
        }
        self.persist_logged();
    }

    fn fallback_for(&self, target: usize) -> usize {
        self.last_boot
            .filter(|index| *index != target)
            .filter(|index| {
                let partition = &self.partitions[*index];
                partition.info.role.is_factory()
                    || partition.state == Some(ImageValidationState::Valid)
            })
            .unwrap_or(0)
    }

    /// Writes `image` straight into `slot` and selects it for the next boot.
    pub fn install(&mut self, slot: u8, image: &[u8]) -> Result<(), PartitionError> {
        let index = self
            .slot_index(slot)
            .ok_or(PartitionError::NoUpdateSlot)?;
        let partition = &mut self.partitions[index];
        if image.len() > partition.info.size as usize {
            return Err(PartitionError::ImageTooLarge {
                label: partition.info.label.clone(),
                capacity: partition.info.size,
            });
        }
        partition.image = image.to_vec();
        partition.state = Some(ImageValidationState::New);
        self.boot = index;
        self.persist()
    }

    pub fn set_unreadable(&mut self, label: &str, unreadable: bool) {
        if let Some(index) = self.index_of(label) {
            self.partitions[index].unreadable = unreadable;
        }
    }

    /// Fails any write that would take the slot past `limit` bytes.
    pub fn fail_writes_after(&mut self, limit: Option<u64>) {
        self.fail_writes_after = limit;
    }

    pub fn fail_complete(&mut self, fail: bool) {
        self.fail_complete = fail;
    }

    pub fn fail_mark_valid(&mut self, fail: bool) {
        self.fail_mark_valid = fail;
    }

    pub fn image(&self, label: &str) -> Option<&[u8]> {
        self.index_of(label)
            .map(|index| self.partitions[index].image.as_slice())
    }

    pub fn mark_valid_calls(&self) -> usize {
        self.mark_valid_calls
    }

    pub fn erase_calls(&self) -> usize {
        self.erase_calls
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls
    }

    pub fn begin_update_calls(&self) -> usize {
        self.begin_update_calls
    }

    fn index_of(&self, label: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.info.label == label)
    }

    fn slot_index(&self, slot: u8) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.info.role == PartitionRole::OtaSlot(slot))
    }

    fn partition(&self, info: &PartitionInfo) -> Result<&SimPartition, PartitionError> {
        let index = self
            .index_of(&info.label)
            .ok_or_else(|| PartitionError::Unreadable {
                label: info.label.clone(),
                detail: "no such partition".to_string(),
            })?;
        let partition = &self.partitions[index];
        if partition.unreadable {
            return Err(PartitionError::Unreadable {
                label: info.label.clone(),
                detail: "flash read failed".to_string(),
            });
        }
        Ok(partition)
    }

    fn next_update_index(&self) -> Option<usize> {
        let slots: Vec<usize> = (0..self.partitions.len())
            .filter(|index| !self.partitions[*index].info.role.is_factory())
            .collect();
        let next = match self.partitions[self.running].info.role {
            PartitionRole::Factory => slots.first().copied(),
            PartitionRole::OtaSlot(_) => slots
                .iter()
                .position(|index| *index == self.running)
                .map(|pos| slots[(pos + 1) % slots.len()]),
        };
        next.filter(|index| *index != self.running)
    }
}

impl PartitionTable for SimFlash {
    type Writer<'a> = SimWriter<'a>;

    fn running(&self) -> Result<PartitionInfo, PartitionError> {
        Ok(self.partitions[self.running].info.clone())
    }

    fn boot_target(&self) -> Result<PartitionInfo, PartitionError> {
        Ok(self.partitions[self.boot].info.clone())
    }

    fn validation_state(
        &self,
        partition: &PartitionInfo,
    ) -> Result<Option<ImageValidationState>, PartitionError> {
        let partition = self.partition(partition)?;
        if partition.info.role.is_factory() {
            return Ok(None);
        }
        Ok(partition.state)
    }

    fn image_digest(&self, partition: &PartitionInfo) -> Result<FirmwareDigest, PartitionError> {
        let partition = self.partition(partition)?;
        if partition.image.is_empty() {
            return Err(PartitionError::Unreadable {
                label: partition.info.label.clone(),
                detail: "partition holds no image".to_string(),
            });
        }
        Ok(FirmwareDigest::of_bytes(&partition.image))
    }

    fn image_descriptor(
        &self,
        partition: &PartitionInfo,
    ) -> Result<ImageDescriptor, PartitionError> {
        let partition = self.partition(partition)?;
        ImageDescriptor::parse(&partition.image)
            .map_err(|err| PartitionError::Descriptor(partition.info.label.clone(), err))
    }

    fn mark_running_valid(&mut self) -> Result<(), PartitionError> {
        self.mark_valid_calls += 1;
        if self.fail_mark_valid {
            return Err(PartitionError::platform("mark app valid", "otadata write failed"));
        }
        let running = &mut self.partitions[self.running];
        if !running.info.role.is_factory() {
            running.state = Some(ImageValidationState::Valid);
        }
        self.persist()
    }

    fn erase_last_boot_partition(&mut self) -> Result<(), PartitionError> {
        self.erase_calls += 1;
        let index = self
            .last_boot
            .filter(|index| *index != self.running)
            .filter(|index| !self.partitions[*index].info.role.is_factory())
            .ok_or_else(|| {
                PartitionError::platform("erase last boot partition", "no previous OTA slot")
            })?;

        let partition = &mut self.partitions[index];
        partition.image.clear();
        partition.state = None;
        self.last_boot = None;
        self.persist()
    }

    fn begin_update(&mut self) -> Result<SimWriter<'_>, PartitionError> {
        self.begin_update_calls += 1;
        let index = self.next_update_index().ok_or(PartitionError::NoUpdateSlot)?;

        let partition = &mut self.partitions[index];
        partition.image.clear();
        partition.state = None;
        let info = partition.info.clone();

        Ok(SimWriter {
            flash: self,
            index,
            info,
            written: 0,
        })
    }
}

pub struct SimWriter<'a> {
    flash: &'a mut SimFlash,
    index: usize,
    info: PartitionInfo,
    written: u64,
}

impl FirmwareWriter for SimWriter<'_> {
    fn target(&self) -> &PartitionInfo {
        &self.info
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), PartitionError> {
        let next = self.written + chunk.len() as u64;
        if self.flash.fail_writes_after.is_some_and(|limit| next > limit) {
            return Err(PartitionError::platform("ota write", "flash write fault"));
        }
        if next > u64::from(self.info.size) {
            return Err(PartitionError::ImageTooLarge {
                label: self.info.label.clone(),
                capacity: self.info.size,
            });
        }

        self.flash.partitions[self.index]
            .image
            .extend_from_slice(chunk);
        self.written = next;
        Ok(())
    }

    fn complete(self) -> Result<PartitionInfo, PartitionError> {
        let Self {
            flash, index, info, ..
        } = self;
        if flash.fail_complete {
            return Err(PartitionError::platform("ota end", "image verification failed"));
        }

        let partition = &mut flash.partitions[index];
        ImageDescriptor::parse(&partition.image)
            .map_err(|err| PartitionError::Descriptor(info.label.clone(), err))?;
        partition.state = Some(ImageValidationState::New);
        flash.boot = index;
        flash.persist()?;
        Ok(info)
    }

    fn abort(self) -> Result<(), PartitionError> {
        let Self { flash, index, .. } = self;
        flash.abort_calls += 1;
        let partition = &mut flash.partitions[index];
        partition.image.clear();
        partition.state = None;
        flash.persist()
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PartitionError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|err| PartitionError::platform("write flash image", err))?;
    fs::rename(&tmp, path).map_err(|err| PartitionError::platform("write flash image", err))
}

#[derive(Default)]
struct KvState {
    committed: HashMap<String, HashMap<String, Vec<u8>>>,
    fail_opens: bool,
    fail_reads: bool,
    fail_writes: bool,
    fail_commits: bool,
    commits: usize,
}

/// NVS stand-in. Writes are staged per handle and only reach the shared
/// map on commit.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<KvState>>,
}

impl MemoryKvStore {
    fn lock(&self) -> MutexGuard<'_, KvState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_opens(&self, fail: bool) {
        self.lock().fail_opens = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn insert_committed(&self, namespace: &str, key: &str, value: &[u8]) {
        self.lock()
            .committed
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    pub fn committed(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .committed
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned()
    }
}

impl KvStore for MemoryKvStore {
    type Namespace = MemoryNamespace;

    fn open(&self, namespace: &str) -> Result<MemoryNamespace, StoreError> {
        if self.lock().fail_opens {
            return Err(StoreError::Open {
                namespace: namespace.to_string(),
                detail: "nvs partition not initialised".to_string(),
            });
        }
        Ok(MemoryNamespace {
            store: self.clone(),
            namespace: namespace.to_string(),
            staged: HashMap::new(),
        })
    }
}

pub struct MemoryNamespace {
    store: MemoryKvStore,
    namespace: String,
    staged: HashMap<String, Vec<u8>>,
}

impl KvNamespace for MemoryNamespace {
    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let state = self.store.lock();
        if state.fail_reads {
            return Err(StoreError::Read {
                key: key.to_string(),
                detail: "read fault".to_string(),
            });
        }

        let value = self.staged.get(key).or_else(|| {
            state
                .committed
                .get(&self.namespace)
                .and_then(|entries| entries.get(key))
        });
        Ok(value.map(|value| {
            if let Some(dst) = buf.get_mut(..value.len()) {
                dst.copy_from_slice(value);
            }
            value.len()
        }))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.store.lock().fail_writes {
            return Err(StoreError::Write {
                key: key.to_string(),
                detail: "write fault".to_string(),
            });
        }
        self.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        if state.fail_commits {
            return Err(StoreError::Commit("commit fault".to_string()));
        }
        let entries = state.committed.entry(self.namespace.clone()).or_default();
        entries.extend(self.staged.drain());
        state.commits += 1;
        Ok(())
    }
}

struct SourceState {
    image: Vec<u8>,
    declared_len: Option<Option<u64>>,
    truncate_at: Option<usize>,
    fail_read_after: Option<usize>,
    failing_connects: usize,
    opens: usize,
}

/// Serves one image over a pretend HTTP connection. Clones share state so
/// a test can keep a handle after giving one to the task.
#[derive(Clone)]
pub struct SimSource {
    inner: Arc<Mutex<SourceState>>,
}

impl SimSource {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceState {
                image,
                declared_len: None,
                truncate_at: None,
                fail_read_after: None,
                failing_connects: 0,
                opens: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_image(&self, image: Vec<u8>) {
        self.lock().image = image;
    }

    /// Overrides the advertised body length. `None` omits it.
    pub fn declare_len(&self, len: Option<u64>) {
        self.lock().declared_len = Some(len);
    }

    /// Ends the body early while still advertising the full length.
    pub fn truncate_at(&self, len: usize) {
        self.lock().truncate_at = Some(len);
    }

    pub fn fail_read_after(&self, offset: usize) {
        self.lock().fail_read_after = Some(offset);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.declared_len = None;
        state.truncate_at = None;
        state.fail_read_after = None;
        state.failing_connects = 0;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }
}

impl FirmwareSource for SimSource {
    type Stream = SimStream;

    fn open(&mut self, url: &str) -> Result<SimStream, FetchError> {
        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(FetchError::Connect(format!("{url}: connection refused")));
        }
        state.opens += 1;

        let end = state
            .truncate_at
            .map_or(state.image.len(), |len| len.min(state.image.len()));
        Ok(SimStream {
            body: state.image[..end].to_vec(),
            declared_len: state
                .declared_len
                .unwrap_or(Some(state.image.len() as u64)),
            fail_read_after: state.fail_read_after,
            position: 0,
        })
    }
}

pub struct SimStream {
    body: Vec<u8>,
    declared_len: Option<u64>,
    fail_read_after: Option<usize>,
    position: usize,
}

impl ImageStream for SimStream {
    fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        let mut end = self.body.len();
        if let Some(fail_at) = self.fail_read_after {
            if self.position >= fail_at {
                return Err(FetchError::Read {
                    received: self.position as u64,
                    detail: "connection reset".to_string(),
                });
            }
            end = end.min(fail_at);
        }

        let count = buf
            .len()
            .min(STREAM_SEGMENT)
            .min(end.saturating_sub(self.position));
        buf[..count].copy_from_slice(&self.body[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

/// Counts restart requests instead of resetting.
#[derive(Clone, Default)]
pub struct RecordingReset {
    count: Arc<AtomicUsize>,
}

impl RecordingReset {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl SystemReset for RecordingReset {
    fn restart(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records requested delays and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingDelay {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Delay for RecordingDelay {
    fn delay(&self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}
