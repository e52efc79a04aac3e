//! Fetching and installing tunnel artifacts.
//!
//! Every artifact is downloaded into a staging directory inside the tunnel
//! directory, verified, unpacked, made executable, and only then renamed to
//! its final path. A failed install never leaves a file at the target, so
//! [`is_installed`] cannot report a half-finished download.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ArchiveKind, Artifact, TunnelError, TunnelEvent, TunnelResult};

/// Returns `true` if every artifact is present in `directory`.
pub fn is_installed(artifacts: &[Artifact], directory: &Path) -> bool {
    artifacts
        .iter()
        .all(|artifact| artifact.path_in(directory).is_file())
}

/// Downloads and installs `artifacts` into `directory`, in order.
pub async fn install_all(
    client: &reqwest::Client,
    artifacts: &[Artifact],
    directory: &Path,
    events: &broadcast::Sender<TunnelEvent>,
) -> TunnelResult<()> {
    tokio::fs::create_dir_all(directory).await?;

    for artifact in artifacts {
        let _ = events.send(TunnelEvent::Status(format!("Downloading {}", artifact.name)));
        install(client, artifact, directory, events).await?;
        info!(
            "Installed {} to {}",
            artifact.name,
            artifact.path_in(directory).display()
        );
    }
    Ok(())
}

async fn install(
    client: &reqwest::Client,
    artifact: &Artifact,
    directory: &Path,
    events: &broadcast::Sender<TunnelEvent>,
) -> TunnelResult<()> {
    let staging = tempfile::Builder::new()
        .prefix(".download-")
        .tempdir_in(directory)?;
    let download_path = staging.path().join("download");
    let staged_path = staging.path().join("installed");

    fetch(client, artifact, &download_path, events).await?;

    if let Some(expected) = &artifact.sha256 {
        let path = download_path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))??;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(TunnelError::Checksum {
                artifact: artifact.name.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    let unpack_artifact = artifact.clone();
    let unpack_to = staged_path.clone();
    tokio::task::spawn_blocking(move || unpack(&unpack_artifact, &download_path, &unpack_to))
        .await
        .map_err(|e| TunnelError::Internal(e.to_string()))??;

    if artifact.executable {
        make_executable(&staged_path)?;
    }

    let target = artifact.path_in(directory);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&staged_path, &target).await?;
    Ok(())
}

async fn fetch(
    client: &reqwest::Client,
    artifact: &Artifact,
    path: &Path,
    events: &broadcast::Sender<TunnelEvent>,
) -> TunnelResult<()> {
    debug!("GET {}", artifact.url);
    let mut response = client
        .get(&artifact.url)
        .send()
        .await
        .map_err(|e| TunnelError::Download(format!("{}: {}", artifact.url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TunnelError::Download(format!(
            "{} returned {}",
            artifact.url, status
        )));
    }

    let total = response.content_length();
    let mut loaded = 0u64;
    let progress = |loaded: u64| TunnelEvent::DownloadProgress {
        artifact: artifact.name.clone(),
        loaded,
        total,
    };
    let _ = events.send(progress(0));

    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TunnelError::Download(format!("{}: {}", artifact.url, e)))?
    {
        file.write_all(&chunk).await?;
        loaded += chunk.len() as u64;
        let _ = events.send(progress(loaded));
    }
    file.flush().await?;

    if let Some(total) = total
        && loaded != total
    {
        return Err(TunnelError::Download(format!(
            "{}: received {} of {} bytes",
            artifact.url, loaded, total
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> TunnelResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn unpack(artifact: &Artifact, source: &Path, dest: &Path) -> TunnelResult<()> {
    let fail = |message: String| TunnelError::Unpack {
        artifact: artifact.name.clone(),
        message,
    };
    let wanted = artifact.entry.as_deref();

    match artifact.archive {
        ArchiveKind::Raw => std::fs::rename(source, dest).map_err(|e| fail(e.to_string())),
        ArchiveKind::Zip => {
            let file = File::open(source).map_err(|e| fail(e.to_string()))?;
            let mut archive = zip::ZipArchive::new(file).map_err(|e| fail(e.to_string()))?;

            let mut found = None;
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| fail(e.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let name = PathBuf::from(entry.name());
                check_entry_path(&name).map_err(fail)?;
                if entry_matches(&name, wanted) {
                    found = Some(i);
                    break;
                }
            }

            let index = found.ok_or_else(|| fail(missing_entry(wanted)))?;
            let mut entry = archive.by_index(index).map_err(|e| fail(e.to_string()))?;
            let mut out = File::create(dest).map_err(|e| fail(e.to_string()))?;
            io::copy(&mut entry, &mut out).map_err(|e| fail(e.to_string()))?;
            Ok(())
        }
        ArchiveKind::TarGz => {
            let file = File::open(source).map_err(|e| fail(e.to_string()))?;
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

            for entry in archive.entries().map_err(|e| fail(e.to_string()))? {
                let mut entry = entry.map_err(|e| fail(e.to_string()))?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let name = entry.path().map_err(|e| fail(e.to_string()))?.to_path_buf();
                check_entry_path(&name).map_err(fail)?;
                if entry_matches(&name, wanted) {
                    let mut out = File::create(dest).map_err(|e| fail(e.to_string()))?;
                    io::copy(&mut entry, &mut out).map_err(|e| fail(e.to_string()))?;
                    return Ok(());
                }
            }
            Err(fail(missing_entry(wanted)))
        }
    }
}

fn check_entry_path(path: &Path) -> Result<(), String> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(format!("unsafe archive entry {}", path.display()));
    }
    Ok(())
}

/// Matches an archive entry against the wanted name. A bare file name
/// matches at any depth.
fn entry_matches(path: &Path, wanted: Option<&str>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    let wanted = Path::new(wanted.trim_start_matches("./"));
    let path = path.strip_prefix(".").unwrap_or(path);
    if wanted.components().count() == 1 {
        path.file_name() == wanted.file_name()
    } else {
        path == wanted
    }
}

fn missing_entry(wanted: Option<&str>) -> String {
    match wanted {
        Some(name) => format!("archive has no entry named {}", name),
        None => "archive contains no files".to_string(),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// A throwaway HTTP server for download tests.
#[cfg(test)]
pub(crate) mod test_server {
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use tiny_http::{Response, Server};

    /// A request as the server saw it.
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: String,
        pub path: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl RecordedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(field, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    pub struct TestServer {
        pub base_url: String,
        server: Arc<Server>,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    }

    impl TestServer {
        pub fn hits(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.server.unblock();
        }
    }

    /// Serves `routes` (path to body) until the returned server is dropped.
    /// Unknown paths get a 404.
    pub fn serve(routes: HashMap<String, Vec<u8>>) -> TestServer {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let listener = Arc::clone(&server);
        let log = Arc::clone(&requests);
        thread::spawn(move || {
            for mut request in listener.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let recorded = RecordedRequest {
                    method: request.method().to_string(),
                    path: request.url().to_string(),
                    headers: request
                        .headers()
                        .iter()
                        .map(|h| (h.field.to_string(), h.value.to_string()))
                        .collect(),
                    body,
                };
                let response = match routes.get(&recorded.path) {
                    Some(body) => Response::from_data(body.clone()),
                    None => Response::from_string("not found").with_status_code(404),
                };
                log.lock().unwrap().push(recorded);
                let _ = request.respond(response);
            }
        });

        TestServer {
            base_url: format!("http://{addr}"),
            server,
            requests,
        }
    }

    pub fn zip_with(name: &str, contents: &[u8]) -> Vec<u8> {
        use std::io::Write;

        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap().into_inner()
    }

    pub fn tar_gz_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }
}
