use core::ffi::CStr;
use std::{ffi::CString, thread, time::Duration};

use anyhow::anyhow;
use embedded_svc::{
    http::{Headers, Method, Status},
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    sys::{self, esp, esp_partition_t, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use serde::Serialize;

use clock_common::{
    FetchError, FirmwareDigest, FirmwareSource, FirmwareWriter, ImageDescriptor,
    ImageStream, ImageValidationState, KvNamespace, KvStore, NetworkSignal, OtaConfig,
    OtaPlatform, OtaStatusHandle, OtaTask, PartitionError, PartitionInfo, PartitionRole,
    PartitionTable, StoreError, SystemReset, ThreadDelay, DESCRIPTOR_PREFIX_LEN,
};

const WIFI_SSID: &str = match option_env!("CLOCK_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "",
};
const WIFI_PASS: &str = match option_env!("CLOCK_WIFI_PASS") {
    Some(pass) => pass,
    None => "",
};
const WIFI_RETRY_DELAY_MS: u64 = 5_000;
const WIFI_POLL_INTERVAL_MS: u64 = 2_000;
const OTA_TASK_STACK: usize = 16 * 1024;

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut config = OtaConfig::default();
    config.sanitize();

    let network = NetworkSignal::new();
    let status = OtaStatusHandle::new();

    {
        let network = network.clone();
        let status = status.clone();
        let nvs_partition = nvs_partition.clone();
        thread::Builder::new()
            .name("ota-update".to_string())
            .stack_size(OTA_TASK_STACK)
            .spawn(move || run_ota_task(config, nvs_partition, network, status))?;
    }

    let _server = create_http_server(status)?;

    maintain_wifi(modem, sys_loop, nvs_partition, &network)
}

fn run_ota_task(
    config: OtaConfig,
    nvs_partition: EspDefaultNvsPartition,
    network: NetworkSignal,
    status: OtaStatusHandle,
) {
    let ota = match EspOta::new() {
        Ok(ota) => ota,
        Err(err) => {
            error!("failed to acquire OTA: {err:?}");
            return;
        }
    };

    let source = EspHttpSource {
        timeout: Duration::from_millis(config.read_timeout_ms),
    };
    let mut task = OtaTask::new(
        config,
        OtaPlatform {
            table: EspPartitions { ota },
            kv: EspNvsStore {
                partition: nvs_partition,
            },
            source,
            reset: EspReset,
            delay: ThreadDelay,
        },
        network,
        status,
    );

    match task.run() {
        Ok(summary) => info!("ota task finished: {:?}", summary.exit),
        Err(err) => error!("ota task stopped: {err}"),
    }
}

fn create_http_server(status: OtaStatusHandle) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 8 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/api/ota/status", Method::Get, move |req| {
        write_json(req, &status.snapshot())
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// Brings the station up and keeps the network signal in step with the
/// link. Never returns while the device is running.
fn maintain_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkSignal,
) -> anyhow::Result<()> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if WIFI_SSID.is_empty() {
        warn!("wifi credentials missing; updates will not be checked");
    }

    let auth_method = if WIFI_PASS.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: WIFI_SSID
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: WIFI_PASS
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;
    info!("wifi started, connecting to `{WIFI_SSID}`");

    loop {
        if wifi.is_connected().unwrap_or(false) {
            thread::sleep(Duration::from_millis(WIFI_POLL_INTERVAL_MS));
            continue;
        }

        if network.is_connected() {
            warn!("wifi link lost");
            network.set_connected(false);
        }

        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up");
                network.set_connected(true);
            }
            Err(err) => {
                warn!("wifi connect failed: {err:#}; retrying in {WIFI_RETRY_DELAY_MS}ms");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }
}

/// Partition table access through the ESP-IDF OTA and partition APIs.
struct EspPartitions {
    ota: EspOta,
}

fn platform_err(operation: &'static str) -> impl FnOnce(EspError) -> PartitionError {
    move |err| PartitionError::platform(operation, format!("{err:?}"))
}

fn partition_info(raw: *const esp_partition_t) -> Result<PartitionInfo, PartitionError> {
    // Partition records live in the mapped partition table for the lifetime
    // of the program.
    let part = unsafe { raw.as_ref() }
        .ok_or_else(|| PartitionError::platform("partition lookup", "no such partition"))?;
    let label = unsafe { CStr::from_ptr(part.label.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let role = if part.subtype == sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY {
        PartitionRole::Factory
    } else {
        let slot = part
            .subtype
            .saturating_sub(sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN);
        PartitionRole::OtaSlot(slot as u8)
    };

    Ok(PartitionInfo {
        label,
        role,
        address: part.address,
        size: part.size,
    })
}

fn find_partition(info: &PartitionInfo) -> Result<*const esp_partition_t, PartitionError> {
    let label = CString::new(info.label.as_str())
        .map_err(|err| PartitionError::platform("partition lookup", err))?;
    let raw = unsafe {
        sys::esp_partition_find_first(
            sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            label.as_ptr(),
        )
    };
    if raw.is_null() {
        return Err(PartitionError::Unreadable {
            label: info.label.clone(),
            detail: "partition not found".to_string(),
        });
    }
    Ok(raw)
}

impl PartitionTable for EspPartitions {
    type Writer<'a> = EspSlotWriter<'a>;

    fn running(&self) -> Result<PartitionInfo, PartitionError> {
        partition_info(unsafe { sys::esp_ota_get_running_partition() })
    }

    fn boot_target(&self) -> Result<PartitionInfo, PartitionError> {
        partition_info(unsafe { sys::esp_ota_get_boot_partition() })
    }

    fn validation_state(
        &self,
        partition: &PartitionInfo,
    ) -> Result<Option<ImageValidationState>, PartitionError> {
        if partition.role.is_factory() {
            return Ok(None);
        }

        let raw = find_partition(partition)?;
        let mut state: sys::esp_ota_img_states_t = 0;
        let rc = unsafe { sys::esp_ota_get_state_partition(raw, &mut state) };
        if rc == sys::ESP_ERR_NOT_FOUND {
            return Ok(None);
        }
        esp!(rc).map_err(platform_err("read ota state"))?;

        #[allow(non_upper_case_globals)]
        let state = match state {
            sys::esp_ota_img_states_t_ESP_OTA_IMG_NEW => Some(ImageValidationState::New),
            sys::esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => {
                Some(ImageValidationState::PendingVerify)
            }
            sys::esp_ota_img_states_t_ESP_OTA_IMG_VALID => Some(ImageValidationState::Valid),
            sys::esp_ota_img_states_t_ESP_OTA_IMG_INVALID
            | sys::esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => Some(ImageValidationState::Invalid),
            _ => None,
        };
        Ok(state)
    }

    fn image_digest(&self, partition: &PartitionInfo) -> Result<FirmwareDigest, PartitionError> {
        let raw = find_partition(partition)?;
        let mut digest = [0_u8; 32];
        esp!(unsafe { sys::esp_partition_get_sha256(raw, digest.as_mut_ptr()) }).map_err(
            |err| PartitionError::Unreadable {
                label: partition.label.clone(),
                detail: format!("{err:?}"),
            },
        )?;
        Ok(FirmwareDigest::from_bytes(digest))
    }

    fn image_descriptor(
        &self,
        partition: &PartitionInfo,
    ) -> Result<ImageDescriptor, PartitionError> {
        let raw = find_partition(partition)?;
        let mut prefix = [0_u8; DESCRIPTOR_PREFIX_LEN];
        esp!(unsafe {
            sys::esp_partition_read(raw, 0, prefix.as_mut_ptr().cast(), prefix.len())
        })
        .map_err(|err| PartitionError::Unreadable {
            label: partition.label.clone(),
            detail: format!("{err:?}"),
        })?;

        ImageDescriptor::parse(&prefix)
            .map_err(|err| PartitionError::Descriptor(partition.label.clone(), err))
    }

    fn mark_running_valid(&mut self) -> Result<(), PartitionError> {
        self.ota
            .mark_running_slot_valid()
            .map_err(platform_err("mark running slot valid"))
    }

    fn erase_last_boot_partition(&mut self) -> Result<(), PartitionError> {
        esp!(unsafe { sys::esp_ota_erase_last_boot_app_partition() })
            .map_err(platform_err("erase last boot partition"))
    }

    fn begin_update(&mut self) -> Result<EspSlotWriter<'_>, PartitionError> {
        let next = unsafe { sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if next.is_null() {
            return Err(PartitionError::NoUpdateSlot);
        }
        let target = partition_info(next)?;

        let update = self
            .ota
            .initiate_update()
            .map_err(platform_err("initiate ota update"))?;
        Ok(EspSlotWriter { update, target })
    }
}

struct EspSlotWriter<'a> {
    update: EspOtaUpdate<'a>,
    target: PartitionInfo,
}

impl FirmwareWriter for EspSlotWriter<'_> {
    fn target(&self) -> &PartitionInfo {
        &self.target
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), PartitionError> {
        self.update
            .write(chunk)
            .map(|_| ())
            .map_err(platform_err("ota write"))
    }

    fn complete(self) -> Result<PartitionInfo, PartitionError> {
        self.update.complete().map_err(platform_err("ota end"))?;
        Ok(self.target)
    }

    fn abort(self) -> Result<(), PartitionError> {
        self.update.abort().map_err(platform_err("ota abort"))
    }
}

struct EspNvsStore {
    partition: EspDefaultNvsPartition,
}

impl KvStore for EspNvsStore {
    type Namespace = EspNvsNamespace;

    fn open(&self, namespace: &str) -> Result<EspNvsNamespace, StoreError> {
        let nvs = EspNvs::new(self.partition.clone(), namespace, true).map_err(|err| {
            StoreError::Open {
                namespace: namespace.to_string(),
                detail: format!("{err:?}"),
            }
        })?;
        Ok(EspNvsNamespace { nvs })
    }
}

struct EspNvsNamespace {
    nvs: EspNvs<NvsDefault>,
}

impl KvNamespace for EspNvsNamespace {
    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let read_err = |err: EspError| StoreError::Read {
            key: key.to_string(),
            detail: format!("{err:?}"),
        };

        let Some(len) = self.nvs.blob_len(key).map_err(read_err)? else {
            return Ok(None);
        };
        if len <= buf.len() {
            self.nvs.get_blob(key, buf).map_err(read_err)?;
        }
        Ok(Some(len))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.nvs
            .set_blob(key, value)
            .map_err(|err| StoreError::Write {
                key: key.to_string(),
                detail: format!("{err:?}"),
            })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        esp!(unsafe { sys::nvs_commit(self.nvs.handle()) })
            .map_err(|err| StoreError::Commit(format!("{err:?}")))
    }
}

struct EspHttpSource {
    timeout: Duration,
}

impl FirmwareSource for EspHttpSource {
    type Stream = EspHttpStream;

    fn open(&mut self, url: &str) -> Result<EspHttpStream, FetchError> {
        let connect_err = |err: EspError| FetchError::Connect(format!("{err:?}"));

        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
            buffer_size: Some(4096),
            ..Default::default()
        };
        let mut connection = EspHttpConnection::new(&http_conf).map_err(connect_err)?;
        connection
            .initiate_request(Method::Get, url, &[])
            .map_err(connect_err)?;
        connection.initiate_response().map_err(connect_err)?;

        let status = connection.status();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status));
        }

        let declared_len = connection
            .header("content-length")
            .or_else(|| connection.header("Content-Length"))
            .and_then(|value| value.parse::<u64>().ok());

        Ok(EspHttpStream {
            connection,
            declared_len,
            received: 0,
        })
    }
}

struct EspHttpStream {
    connection: EspHttpConnection,
    declared_len: Option<u64>,
    received: u64,
}

impl ImageStream for EspHttpStream {
    fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        let read = self.connection.read(buf).map_err(|err| FetchError::Read {
            received: self.received,
            detail: format!("{err:?}"),
        })?;
        self.received += read as u64;
        Ok(read)
    }
}

struct EspReset;

impl SystemReset for EspReset {
    fn restart(&self) {
        thread::sleep(Duration::from_millis(100));
        unsafe { sys::esp_restart() };
    }
}
