//! File transfers between the device and the cloud file endpoints.
//!
//! Transfers are negotiated over the command channel (`file.get` /
//! `file.put`) and executed here over HTTP(S). Downloads stream into a
//! staging `.part` file and are only moved into place once the CRC32 reported
//! by the cloud matches.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use rand::Rng;
use tokio::sync::watch;

use crate::status::Status;

pub(crate) mod http;

const CHUNK_SIZE: usize = 512;

pub(crate) const DOWNLOAD_DIR: &str = "download";
pub(crate) const UPLOAD_DIR: &str = "upload";

#[derive(Debug, Default)]
struct RemoteFile {
    file_id: Option<String>,
    checksum: Option<u32>,
}

/// State of one negotiated transfer, shared between the reply dispatcher, the
/// worker executing the transfer, and any blocking requester.
///
/// The terminal status is published through a watch channel so that waiters
/// wake on the status edge instead of polling.
#[derive(Debug)]
pub(crate) struct FileTransfer {
    file_name: String,
    remote: Mutex<RemoteFile>,
    status: watch::Sender<Option<Status>>,
}

impl FileTransfer {
    pub(crate) fn new(file_name: impl Into<String>) -> Self {
        let (status, _) = watch::channel(None);
        FileTransfer {
            file_name: file_name.into(),
            remote: Mutex::new(RemoteFile::default()),
            status,
        }
    }

    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Records the cloud-assigned identity from a `file.get`/`file.put` reply.
    pub(crate) fn set_remote(&self, file_id: String, checksum: Option<u32>) {
        let mut remote = self.remote.lock().expect("file transfer state poisoned");
        remote.file_id = Some(file_id);
        remote.checksum = checksum;
    }

    pub(crate) fn file_id(&self) -> Option<String> {
        self.remote
            .lock()
            .expect("file transfer state poisoned")
            .file_id
            .clone()
    }

    pub(crate) fn checksum(&self) -> Option<u32> {
        self.remote
            .lock()
            .expect("file transfer state poisoned")
            .checksum
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.send_replace(Some(status));
    }

    pub(crate) fn status(&self) -> Option<Status> {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Status>> {
        self.status.subscribe()
    }
}

/// Executes negotiated transfers against the cloud file endpoints.
pub(crate) struct FileExchange {
    host: String,
    runtime_dir: PathBuf,
    agent: ureq::Agent,
    secure: bool,
}

impl FileExchange {
    pub(crate) fn new(host: &str, ca_bundle: Option<&Path>, runtime_dir: &Path) -> Result<Self> {
        Ok(FileExchange {
            host: host.to_owned(),
            runtime_dir: runtime_dir.to_owned(),
            agent: http::build_agent(ca_bundle)?,
            secure: ca_bundle.is_some(),
        })
    }

    /// Fetches the file body into `download/` after the cloud accepted a
    /// `file.get`. Never leaves a `.part` file behind.
    pub(crate) fn download(&self, transfer: &FileTransfer) -> Status {
        log::info!("Downloading {:?}", transfer.file_name());

        let download_dir = self.runtime_dir.join(DOWNLOAD_DIR);
        if !download_dir.is_dir() {
            log::error!(
                "Cannot find download directory {:?}. Download cancelled.",
                download_dir
            );
            return Status::NotFound;
        }

        let Some(file_id) = transfer.file_id() else {
            log::error!(
                "No file ID for download of {:?}, reply was incomplete",
                transfer.file_name()
            );
            return Status::Failure;
        };

        let url = match http::file_endpoint(self.secure, &self.host, &file_id) {
            Ok(url) => url,
            Err(error) => {
                log::error!("Failed to download {:?}: {error:#}", transfer.file_name());
                return Status::Failure;
            }
        };

        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                log::error!(
                    "Failed to download {:?} (download error {code})",
                    transfer.file_name()
                );
                return Status::Failure;
            }
            Err(error) => {
                log::error!("Failed to download {:?}: {error}", transfer.file_name());
                return Status::Failure;
            }
        };

        let staging = download_dir.join(staging_name());
        let status = match stream_to_staging(response, &staging) {
            Ok(checksum) if Some(checksum) == transfer.checksum() => {
                match fs::rename(&staging, download_dir.join(transfer.file_name())) {
                    Ok(()) => {
                        log::info!("Successfully downloaded {:?}", transfer.file_name());
                        Status::Success
                    }
                    Err(error) => {
                        log::error!(
                            "Failed to move downloaded {:?} into place: {error}",
                            transfer.file_name()
                        );
                        Status::IoError
                    }
                }
            }
            Ok(_) => {
                log::error!(
                    "Failed to download {:?} (checksums do not match)",
                    transfer.file_name()
                );
                Status::Failure
            }
            Err(error) => {
                log::error!("Failed to download {:?}: {error}", transfer.file_name());
                Status::IoError
            }
        };

        if status != Status::Success {
            let _ = fs::remove_file(&staging);
        }
        status
    }

    /// Posts the file body from `upload/` after the cloud accepted a
    /// `file.put`.
    pub(crate) fn upload(&self, transfer: &FileTransfer) -> Status {
        log::info!("Uploading {:?}", transfer.file_name());

        let upload_dir = self.runtime_dir.join(UPLOAD_DIR);
        if !upload_dir.is_dir() {
            log::error!(
                "Cannot find upload directory {:?}. Upload cancelled.",
                upload_dir
            );
            return Status::NotFound;
        }

        let path = upload_dir.join(transfer.file_name());
        if !path.is_file() {
            log::error!(
                "File {:?} does not exist, cannot upload",
                transfer.file_name()
            );
            return Status::NotFound;
        }

        let Some(file_id) = transfer.file_id() else {
            log::error!(
                "No file ID for upload of {:?}, reply was incomplete",
                transfer.file_name()
            );
            return Status::Failure;
        };

        let url = match http::file_endpoint(self.secure, &self.host, &file_id) {
            Ok(url) => url,
            Err(error) => {
                log::error!("Failed to upload {:?}: {error:#}", transfer.file_name());
                return Status::Failure;
            }
        };

        let body = match File::open(&path) {
            Ok(file) => file,
            Err(error) => {
                log::error!("Unable to open {path:?}: {error}");
                return Status::FileOpenFailed;
            }
        };

        match self.agent.post(&url).send(body) {
            Ok(_) => {
                log::info!("Successfully uploaded {:?}", transfer.file_name());
                Status::Success
            }
            Err(ureq::Error::Status(code, _)) => {
                log::error!(
                    "Failed to upload {:?} (upload error {code})",
                    transfer.file_name()
                );
                Status::Failure
            }
            Err(error) => {
                log::error!("Failed to upload {:?}: {error}", transfer.file_name());
                Status::Failure
            }
        }
    }
}

fn stream_to_staging(response: ureq::Response, staging: &Path) -> io::Result<u32> {
    let mut reader = response.into_reader();
    let mut file = File::create(staging)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
        file.write_all(&chunk[..read])?;
    }
    file.flush()?;
    Ok(hasher.finalize())
}

fn staging_name() -> String {
    let mut rng = rand::thread_rng();
    let digits: String = (0..10).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect();
    format!("{digits}.part")
}

/// CRC32 of a file on disk, accumulated over the same chunk size the
/// download path uses.
pub(crate) fn file_crc32(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_names_are_ten_digits() {
        let name = staging_name();
        assert_eq!(name.len(), "0123456789.part".len());
        assert!(name.ends_with(".part"));
        assert!(name[..10].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn file_crc32_matches_reference_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.bin");
        fs::write(&path, b"123456789").unwrap();
        // Standard CRC-32 check value.
        assert_eq!(file_crc32(&path).unwrap(), 0xCBF4_3926);
    }

    #[test]
    fn transfer_status_wakes_watchers() {
        let transfer = FileTransfer::new("a.bin");
        let mut watcher = transfer.subscribe();

        assert_eq!(transfer.status(), None);
        transfer.set_status(Status::Success);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(transfer.status(), Some(Status::Success));
    }

    #[test]
    fn download_without_directory_makes_no_request() {
        // Unroutable host: reaching the network would fail loudly, NotFound
        // proves the directory check short-circuits.
        let dir = tempfile::tempdir().unwrap();
        let exchange = FileExchange::new("invalid.localdomain", None, dir.path()).unwrap();
        let transfer = FileTransfer::new("a.bin");
        transfer.set_remote("F1".into(), Some(1));

        assert_eq!(exchange.download(&transfer), Status::NotFound);
    }

    #[test]
    fn upload_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(UPLOAD_DIR)).unwrap();
        let exchange = FileExchange::new("invalid.localdomain", None, dir.path()).unwrap();
        let transfer = FileTransfer::new("missing.bin");
        transfer.set_remote("F1".into(), None);

        assert_eq!(exchange.upload(&transfer), Status::NotFound);
    }

    fn crc32(data: &[u8]) -> u32 {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    fn no_part_files(dir: &Path) -> bool {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .all(|entry| !entry.file_name().to_string_lossy().ends_with(".part"))
    }

    #[test]
    fn download_verifies_checksum_and_moves_into_place() {
        let body: Vec<u8> = (0..128u8).collect();
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/file/F1")
            .with_status(200)
            .with_body(body.clone())
            .create();

        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join(DOWNLOAD_DIR);
        fs::create_dir(&download_dir).unwrap();

        let exchange = FileExchange::new(&server.host_with_port(), None, dir.path()).unwrap();
        let transfer = FileTransfer::new("a.bin");
        transfer.set_remote("F1".into(), Some(crc32(&body)));

        assert_eq!(exchange.download(&transfer), Status::Success);
        mock.assert();
        assert_eq!(fs::read(download_dir.join("a.bin")).unwrap(), body);
        assert!(no_part_files(&download_dir));
    }

    #[test]
    fn download_discards_staging_on_checksum_mismatch() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/file/F1")
            .with_status(200)
            .with_body(b"unexpected body")
            .create();

        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join(DOWNLOAD_DIR);
        fs::create_dir(&download_dir).unwrap();

        let exchange = FileExchange::new(&server.host_with_port(), None, dir.path()).unwrap();
        let transfer = FileTransfer::new("a.bin");
        transfer.set_remote("F1".into(), Some(0));

        assert_eq!(exchange.download(&transfer), Status::Failure);
        assert!(!download_dir.join("a.bin").exists());
        assert!(no_part_files(&download_dir));
    }

    #[test]
    fn download_fails_on_http_error() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/file/F1").with_status(404).create();

        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join(DOWNLOAD_DIR);
        fs::create_dir(&download_dir).unwrap();

        let exchange = FileExchange::new(&server.host_with_port(), None, dir.path()).unwrap();
        let transfer = FileTransfer::new("a.bin");
        transfer.set_remote("F1".into(), Some(1));

        assert_eq!(exchange.download(&transfer), Status::Failure);
        assert!(no_part_files(&download_dir));
    }

    #[test]
    fn upload_posts_the_file_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/file/F9")
            .match_body("payload bytes")
            .with_status(200)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join(UPLOAD_DIR);
        fs::create_dir(&upload_dir).unwrap();
        fs::write(upload_dir.join("b.bin"), b"payload bytes").unwrap();

        let exchange = FileExchange::new(&server.host_with_port(), None, dir.path()).unwrap();
        let transfer = FileTransfer::new("b.bin");
        transfer.set_remote("F9".into(), None);

        assert_eq!(exchange.upload(&transfer), Status::Success);
        mock.assert();
    }

    #[test]
    fn upload_fails_on_http_error() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/file/F9").with_status(500).create();

        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join(UPLOAD_DIR);
        fs::create_dir(&upload_dir).unwrap();
        fs::write(upload_dir.join("b.bin"), b"payload bytes").unwrap();

        let exchange = FileExchange::new(&server.host_with_port(), None, dir.path()).unwrap();
        let transfer = FileTransfer::new("b.bin");
        transfer.set_remote("F9".into(), None);

        assert_eq!(exchange.upload(&transfer), Status::Failure);
    }
}
