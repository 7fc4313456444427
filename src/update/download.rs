//! Streaming artifact download to a staging file
//!
//! The response body is written chunk by chunk to a temporary sibling of the
//! live executable. Progress is coalesced, cancellation is checked between
//! chunks, and the partial file is removed on every failure path.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

use super::UpdateError;

/// How often a quiet transfer wakes up to look at the cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Cooperative cancellation flag shared between the UI and the downloader
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A fully downloaded, not yet verified artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub path: PathBuf,
    /// Bytes actually written to `path`
    pub bytes_written: u64,
    /// Length announced by the server (`Content-Length`), if any
    pub declared_size: Option<u64>,
}

/// Something that can fetch an artifact into a staging path
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<StagedArtifact, UpdateError>;
}

/// Rate limiter for progress callbacks
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a report is due at `now`; the first call always is
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Removes the staging file when dropped unless the download succeeded
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            keep: false,
        }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                "could not remove partial download: {}",
                e
            ),
        }
    }
}

/// Downloads over HTTP(S) with reqwest's streaming body
pub struct HttpDownloader {
    client: reqwest::Client,
    progress_interval: Duration,
    stall_timeout: Duration,
}

impl HttpDownloader {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        stall_timeout: Duration,
        progress_interval: Duration,
    ) -> Result<Self, UpdateError> {
        // No overall timeout: large artifacts on slow links are fine as long as bytes keep flowing
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| UpdateError::Network(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            progress_interval,
            stall_timeout,
        })
    }
}

#[async_trait]
impl ArtifactSource for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<StagedArtifact, UpdateError> {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        tracing::info!(url, dest = %dest.display(), "downloading update");

        let request = self.client.get(url).send();
        tokio::pin!(request);
        let requested = Instant::now();
        let response = loop {
            if cancel.is_cancelled() {
                tracing::info!("download cancelled before the server responded");
                return Err(UpdateError::Cancelled);
            }
            match tokio::time::timeout(CANCEL_POLL, &mut request).await {
                Ok(result) => break result.map_err(|e| UpdateError::Network(e.to_string()))?,
                Err(_) if requested.elapsed() >= self.stall_timeout => {
                    return Err(UpdateError::Network(format!(
                        "no response from download server within {:?}",
                        self.stall_timeout
                    )));
                }
                Err(_) => continue,
            }
        };

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "download returned status {}",
                response.status()
            )));
        }

        let declared_size = response.content_length();

        // Guard first so the file handle below is closed before the guard deletes
        let guard = PartialFile::new(dest);
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            UpdateError::Disk(format!("cannot create {}: {}", dest.display(), e))
        })?;

        let mut stream = response.bytes_stream();
        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut written: u64 = 0;
        let mut last_chunk = Instant::now();

        on_progress(0, declared_size);
        throttle.ready(Instant::now());

        loop {
            if cancel.is_cancelled() {
                tracing::info!(bytes = written, "download cancelled");
                return Err(UpdateError::Cancelled);
            }

            let chunk = match tokio::time::timeout(CANCEL_POLL, stream.next()).await {
                Err(_) => {
                    if last_chunk.elapsed() >= self.stall_timeout {
                        return Err(UpdateError::Network(format!(
                            "download stalled for {:?} after {} bytes",
                            self.stall_timeout,
                            written
                        )));
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(UpdateError::Network(format!(
                        "download interrupted after {} bytes: {}",
                        written, e
                    )));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            last_chunk = Instant::now();
            file.write_all(&chunk).await.map_err(|e| {
                UpdateError::Disk(format!("cannot write {}: {}", dest.display(), e))
            })?;
            written += chunk.len() as u64;

            if throttle.ready(last_chunk) {
                on_progress(written, declared_size);
            }
        }

        let flush_err = |e: std::io::Error| {
            UpdateError::Disk(format!("cannot flush {}: {}", dest.display(), e))
        };
        file.flush().await.map_err(flush_err)?;
        file.sync_all().await.map_err(flush_err)?;
        drop(file);

        on_progress(written, declared_size);
        if cancel.is_cancelled() {
            tracing::info!(bytes = written, "download cancelled after the last chunk");
            return Err(UpdateError::Cancelled);
        }

        if let Some(declared) = declared_size {
            if declared != written {
                return Err(UpdateError::Integrity(format!(
                    "server announced {} bytes but {} were received",
                    declared, written
                )));
            }
        }

        guard.keep();
        tracing::info!(bytes = written, path = %dest.display(), "download complete");

        Ok(StagedArtifact {
            path: dest.to_path_buf(),
            bytes_written: written,
            declared_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader() -> HttpDownloader {
        HttpDownloader::new(
            "stt-updater-test",
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(0),
        )
        .unwrap()
    }

    async fn serve(body: Vec<u8>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/STTDesktop.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_throttle_coalesces() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(50)));
        assert!(throttle.ready(start + Duration::from_millis(120)));
        assert!(!throttle.ready(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_progress() {
        let body = vec![7u8; 64 * 1024];
        let server = serve(body.clone()).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let reports = Mutex::new(Vec::new());
        let on_progress = |done: u64, total: Option<u64>| reports.lock().unwrap().push((done, total));

        let staged = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &on_progress,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(staged.bytes_written, body.len() as u64);
        assert_eq!(staged.declared_size, Some(body.len() as u64));
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.first(), Some(&(0, Some(body.len() as u64))));
        assert_eq!(reports.last(), Some(&(body.len() as u64, Some(body.len() as u64))));
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_file() {
        let server = serve(vec![1u8; 1024]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let cancel = CancelFlag::new();
        let cancel_from_progress = cancel.clone();
        // Cancel as soon as the transfer starts reporting
        let on_progress = move |_done: u64, _total: Option<u64>| cancel_from_progress.cancel();

        let err = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &on_progress,
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_leaves_no_file() {
        let server = serve(vec![3u8; 1024 * 1024]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let cancel = CancelFlag::new();
        let cancel_from_progress = cancel.clone();
        let on_progress = move |done: u64, _total: Option<u64>| {
            if done > 0 {
                cancel_from_progress.cancel();
            }
        };

        let err = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &on_progress,
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_on_final_report_leaves_no_file() {
        let body = vec![5u8; 4096];
        let len = body.len() as u64;
        let server = serve(body).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let cancel = CancelFlag::new();
        let cancel_from_progress = cancel.clone();
        let on_progress = move |done: u64, _total: Option<u64>| {
            if done == len {
                cancel_from_progress.cancel();
            }
        };

        let err = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &on_progress,
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 16])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = downloader()
            .download(&format!("{}/STTDesktop.exe", server.uri()), &dest, &|_, _| {}, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");
        let downloader = HttpDownloader::new(
            "stt-updater-test",
            Duration::from_secs(5),
            Duration::from_millis(500),
            Duration::from_millis(0),
        )
        .unwrap();

        let started = Instant::now();
        let err = downloader
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &|_, _| {},
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Network(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_before_start_sends_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = downloader()
            .download(&format!("{}/STTDesktop.exe", server.uri()), &dest, &|_, _| {}, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_http_error_is_network_and_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("STTDesktop.exe.download");

        let err = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &|_, _| {},
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Network(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_disk_error() {
        let server = serve(vec![1u8; 16]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing-dir").join("STTDesktop.exe.download");

        let err = downloader()
            .download(
                &format!("{}/STTDesktop.exe", server.uri()),
                &dest,
                &|_, _| {},
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Disk(_)));
        assert!(!dest.exists());
    }
}
