use std::{
    collections::HashMap,
    fs::{self, File},
    io::{ErrorKind, Read},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use clock_common::{
    sim::{build_image, SimFlash},
    FetchError, FirmwareSource, ImageStream, KvNamespace, KvStore, NetworkSignal, OtaConfig,
    OtaPlatform, OtaStatusHandle, OtaTask, StoreError, SystemReset, TaskExit, ThreadDelay,
};

const FLASH_SLOTS: u8 = 2;
const FACTORY_IMAGE_LEN: usize = 64 * 1024;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("CLOCK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.clock"));

    let mut config = load_config(&data_dir.join("config.json")).unwrap_or_else(|err| {
        warn!("failed to load config: {err:#}");
        OtaConfig::default()
    });
    if let Ok(url) = std::env::var("CLOCK_OTA_URL") {
        config.firmware_url = url;
    }
    config.sanitize();

    let factory_image = match std::env::var("CLOCK_FACTORY_IMAGE") {
        Ok(path) => {
            fs::read(&path).with_context(|| format!("failed to read factory image {path}"))?
        }
        Err(_) => build_image(env!("CARGO_PKG_VERSION"), FACTORY_IMAGE_LEN),
    };

    // Each process start is a power cycle: the bootloader runs first.
    let mut flash = SimFlash::open_dir(data_dir.join("flash"), factory_image, FLASH_SLOTS)
        .context("failed to open simulated flash")?;
    flash.reboot();

    let network = NetworkSignal::new();
    network.set_connected(true);
    let status = OtaStatusHandle::new();

    let mut task = OtaTask::new(
        config,
        OtaPlatform {
            table: flash,
            kv: FileKvStore::new(data_dir.join("nvs.json")),
            source: FileSource,
            reset: ProcessReset,
            delay: ThreadDelay,
        },
        network,
        status.clone(),
    );
    thread::Builder::new()
        .name("ota-update".to_string())
        .spawn(move || match task.run() {
            Ok(summary) if summary.exit == TaskExit::NoUpdateUrl => {
                info!("ota task finished without an update source")
            }
            Ok(summary) => info!("ota task finished: {:?}", summary.exit),
            Err(err) => error!("ota task stopped: {err}"),
        })
        .context("failed to spawn ota thread")?;

    let app = Router::new()
        .route("/api/ota/status", get(handle_get_ota_status))
        .with_state(status);

    let port = std::env::var("CLOCK_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("clock listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_ota_status(State(status): State<OtaStatusHandle>) -> impl IntoResponse {
    Json(status.snapshot())
}

fn load_config(path: &Path) -> anyhow::Result<OtaConfig> {
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid config in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(OtaConfig::default()),
        Err(err) => Err(err.into()),
    }
}

type Namespaces = HashMap<String, HashMap<String, Vec<u8>>>;

/// NVS stand-in backed by one JSON file. Commits rewrite the file through a
/// temporary sibling so a crash leaves either the old or the new contents.
#[derive(Clone)]
struct FileKvStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileKvStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn read_all(&self) -> Result<Namespaces, StoreError> {
        match fs::read(self.path.as_ref()) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| StoreError::Read {
                key: self.path.display().to_string(),
                detail: err.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Namespaces::new()),
            Err(err) => Err(StoreError::Read {
                key: self.path.display().to_string(),
                detail: err.to_string(),
            }),
        }
    }

    fn write_all(&self, namespaces: &Namespaces) -> Result<(), StoreError> {
        let commit_err = |err: &dyn std::fmt::Display| StoreError::Commit(err.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| commit_err(&err))?;
        }
        let payload = serde_json::to_vec_pretty(namespaces).map_err(|err| commit_err(&err))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(|err| commit_err(&err))?;
        fs::rename(&tmp, self.path.as_ref()).map_err(|err| commit_err(&err))
    }
}

impl KvStore for FileKvStore {
    type Namespace = FileNamespace;

    fn open(&self, namespace: &str) -> Result<FileNamespace, StoreError> {
        let committed = self
            .read_all()
            .map_err(|err| StoreError::Open {
                namespace: namespace.to_string(),
                detail: err.to_string(),
            })?
            .remove(namespace)
            .unwrap_or_default();

        Ok(FileNamespace {
            store: self.clone(),
            namespace: namespace.to_string(),
            committed,
            staged: HashMap::new(),
        })
    }
}

struct FileNamespace {
    store: FileKvStore,
    namespace: String,
    committed: HashMap<String, Vec<u8>>,
    staged: HashMap<String, Vec<u8>>,
}

impl KvNamespace for FileNamespace {
    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let value = self.staged.get(key).or_else(|| self.committed.get(key));
        Ok(value.map(|value| {
            if let Some(dst) = buf.get_mut(..value.len()) {
                dst.copy_from_slice(value);
            }
            value.len()
        }))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let _guard = self
            .store
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut namespaces = self.store.read_all()?;
        let entries = namespaces.entry(self.namespace.clone()).or_default();
        entries.extend(self.staged.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.store.write_all(&namespaces)?;

        self.committed.extend(self.staged.drain());
        Ok(())
    }
}

/// Reads candidate images from the local filesystem (`file://` URLs or
/// plain paths). There is no network fetch on the host.
struct FileSource;

impl FirmwareSource for FileSource {
    type Stream = FileStream;

    fn open(&mut self, url: &str) -> Result<FileStream, FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Err(FetchError::Connect(format!(
                "{url}: host builds only read file:// images"
            )));
        }
        let path = url.strip_prefix("file://").unwrap_or(url);

        let file = File::open(path).map_err(|err| FetchError::Connect(format!("{path}: {err}")))?;
        let declared_len = file.metadata().ok().map(|meta| meta.len());
        Ok(FileStream {
            file,
            declared_len,
            received: 0,
        })
    }
}

struct FileStream {
    file: File,
    declared_len: Option<u64>,
    received: u64,
}

impl ImageStream for FileStream {
    fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        let read = self.file.read(buf).map_err(|err| FetchError::Read {
            received: self.received,
            detail: err.to_string(),
        })?;
        self.received += read as u64;
        Ok(read)
    }
}

/// Ends the process; the next start runs the simulated bootloader.
struct ProcessReset;

impl SystemReset for ProcessReset {
    fn restart(&self) {
        info!("restart requested; exiting so the next start boots the new image");
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("nvs.json"));

        let mut ns = store.open("system_info").unwrap();
        ns.set_blob("firmware_hash", &[7; 32]).unwrap();
        ns.commit().unwrap();

        let reopened = FileKvStore::new(dir.path().join("nvs.json"))
            .open("system_info")
            .unwrap();
        let mut buf = [0_u8; 33];
        assert_eq!(reopened.get_blob("firmware_hash", &mut buf).unwrap(), Some(32));
        assert_eq!(&buf[..32], &[7; 32]);
    }

    #[test]
    fn uncommitted_writes_are_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("nvs.json"));

        let mut ns = store.open("system_info").unwrap();
        ns.set_blob("firmware_hash", &[1; 32]).unwrap();
        drop(ns);

        let reopened = store.open("system_info").unwrap();
        let mut buf = [0_u8; 33];
        assert_eq!(reopened.get_blob("firmware_hash", &mut buf).unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("nvs.json"));

        let mut first = store.open("system_info").unwrap();
        first.set_blob("k", b"one").unwrap();
        first.commit().unwrap();
        let mut second = store.open("display").unwrap();
        second.set_blob("k", b"two").unwrap();
        second.commit().unwrap();

        let mut buf = [0_u8; 8];
        let len = store
            .open("system_info")
            .unwrap()
            .get_blob("k", &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"one");
    }

    #[test]
    fn file_source_streams_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.bin");
        let image = build_image("9.9.9", 5000);
        fs::write(&path, &image).unwrap();

        let mut stream = FileSource
            .open(&format!("file://{}", path.display()))
            .unwrap();
        assert_eq!(stream.declared_len(), Some(5000));

        let mut received = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let read = stream.read(&mut buf).unwrap();
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buf[..read]);
        }
        assert_eq!(received, image);
    }

    #[test]
    fn file_source_rejects_network_urls_and_missing_files() {
        assert!(matches!(
            FileSource.open("https://updates.example.com/clock.bin"),
            Err(FetchError::Connect(_))
        ));
        assert!(matches!(
            FileSource.open("/definitely/not/here.bin"),
            Err(FetchError::Connect(_))
        ));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_retries":5,"firmware_url":"file:///tmp/a.bin"}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.firmware_url, "file:///tmp/a.bin");

        assert_eq!(
            load_config(&dir.path().join("missing.json")).unwrap(),
            OtaConfig::default()
        );
    }
}
