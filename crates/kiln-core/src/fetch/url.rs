//! Archive downloads with checksum verification.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use kiln_schema::Sha256Digest;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::stage::Stage;
use super::{FetchContext, FetchError, FetchStrategy, backoff, extract};
use crate::paths::{filename_from_url, is_populated_dir};


/// Fetch an archive over HTTP(S) or from a `file://` URL.
#[derive(Debug, Clone)]
pub struct UrlFetch {
    url: String,
    checksum: Sha256Digest,
    filename: String,
}

enum Attempt {
    /// Worth retrying.
    Transient(String),
    Fatal(String),
}

impl UrlFetch {
    /// Strategy for `url` expected to hash to `checksum`.
    pub fn new(url: String, checksum: Sha256Digest) -> Self {
        let filename = match filename_from_url(&url) {
            "" => "archive".to_string(),
            name => name.to_string(),
        };
        Self { url, checksum, filename }
    }

    /// Where the archive lives inside `stage`.
    pub fn archive_path(&self, stage: &Stage) -> PathBuf {
        stage.path().join(&self.filename)
    }

    fn part_path(&self, stage: &Stage) -> PathBuf {
        stage.path().join(format!("{}.part", self.filename))
    }

    async fn copy_local(&self, path: &str, part: &Path) -> Result<(), FetchError> {
        tokio::fs::copy(path, part).await.map_err(|e| FetchError::FetchFailed {
            url: self.url.clone(),
            cause: e.to_string(),
        })?;
        Ok(())
    }

    async fn download_once(&self, part: &Path, ctx: &FetchContext) -> Result<(), Attempt> {
        let mut request = ctx
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT);
        if let Some(timeout) = ctx.limits.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Attempt::Transient(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(format!("server returned {status}")));
        }

        let mut html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));

        let io_err = |e: std::io::Error| Attempt::Fatal(e.to_string());
        let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut first = true;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            if first {
                html |= looks_like_html(&chunk);
                first = false;
            }
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;

        if html {
            let msg = format!("{} returned an HTML page; the mirror may be serving an error page", self.url);
            tracing::warn!(url = %self.url, "download looks like HTML");
            ctx.reporter.warning(&msg);
        }
        Ok(())
    }

    async fn download(&self, part: &Path, ctx: &FetchContext) -> Result<(), FetchError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                r = self.download_once(part, ctx) => r,
                () = ctx.limits.cancel.cancelled() => {
                    let _ = tokio::fs::remove_file(part).await;
                    return Err(FetchError::Cancelled(self.url.clone()));
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(Attempt::Transient(cause)) if attempt < ctx.retries => {
                    attempt += 1;
                    let wait = backoff(attempt);
                    tracing::warn!(url = %self.url, attempt, %cause, "retrying download");
                    tokio::time::sleep(wait).await;
                }
                Err(Attempt::Transient(cause) | Attempt::Fatal(cause)) => {
                    let _ = tokio::fs::remove_file(part).await;
                    return Err(FetchError::FetchFailed {
                        url: self.url.clone(),
                        cause,
                    });
                }
            }
        }
    }
}

fn classify(e: reqwest::Error) -> Attempt {
    let server_error = e.status().is_some_and(|s| s.is_server_error());
    if e.is_connect() || e.is_timeout() || server_error || e.is_body() {
        Attempt::Transient(e.to_string())
    } else {
        Attempt::Fatal(e.to_string())
    }
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn sha256_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    hasher.flush()?;
    Ok(Sha256Digest::from_hasher(hasher))
}

#[async_trait]
impl FetchStrategy for UrlFetch {
    fn source(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, stage: &Stage, ctx: &FetchContext) -> Result<(), FetchError> {
        let archive = self.archive_path(stage);
        if archive.is_file() {
            tracing::debug!(path = %archive.display(), "archive already present");
            return Ok(());
        }
        stage.create()?;
        let part = self.part_path(stage);

        match self.url.strip_prefix("file://") {
            Some(path) => self.copy_local(path, &part).await?,
            None => self.download(&part, ctx).await?,
        }
        tokio::fs::rename(&part, &archive).await?;
        tracing::info!(url = %self.url, path = %archive.display(), "fetched");
        Ok(())
    }

    async fn verify(&self, stage: &Stage) -> Result<(), FetchError> {
        let archive = self.archive_path(stage);
        if !archive.is_file() {
            return Err(FetchError::NoArchive(archive));
        }
        let path = archive.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(std::io::Error::other)??;
        if actual != self.checksum {
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(FetchError::ChecksumMismatch {
                path: archive,
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    async fn expand(&self, stage: &Stage) -> Result<(), FetchError> {
        let dest = stage.source_path();
        if is_populated_dir(&dest) {
            return Ok(());
        }
        let archive = self.archive_path(stage);
        if !archive.is_file() {
            return Err(FetchError::NoArchive(archive));
        }
        let scratch = stage.scratch(".expand-")?;
        let archive_for_task = archive.clone();
        tokio::task::spawn_blocking(move || {
            extract::expand_into(&archive_for_task, scratch.path(), &dest)
        })
        .await
        .map_err(std::io::Error::other)?
        .map_err(|source| FetchError::Expand { path: archive, source })
    }

    async fn reset(&self, stage: &Stage, _ctx: &FetchContext) -> Result<(), FetchError> {
        stage.clear_except(&[self.filename.as_str()])?;
        self.expand(stage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::extract::tests::write_tar_gz;
    use crate::reporter::Reporter;
    use kiln_schema::ConcreteSpec;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Warnings(Mutex<Vec<String>>);

    impl Reporter for Warnings {
        fn section(&self, _: &str) {}
        fn fetching(&self, _: &ConcreteSpec, _: &str) {}
        fn phase(&self, _: &ConcreteSpec, _: &str) {}
        fn installed(&self, _: &ConcreteSpec, _: &Path) {}
        fn already_installed(&self, _: &ConcreteSpec, _: &Path) {}
        fn failed(&self, _: &ConcreteSpec, _: &str) {}
        fn removing(&self, _: &ConcreteSpec) {}
        fn info(&self, _: &str) {}
        fn warning(&self, msg: &str) {
            self.0.lock().unwrap().push(msg.to_string());
        }
        fn error(&self, _: &str) {}
        fn summary(&self, _: usize, _: &str, _: f64) {}
    }

    fn tarball(dir: &Path) -> (PathBuf, Sha256Digest) {
        let path = dir.join("hello-1.0.tar.gz");
        write_tar_gz(&path, &[("hello-1.0/README", "hello\n"), ("hello-1.0/configure", "exit 0\n")]);
        let digest = sha256_file(&path).unwrap();
        (path, digest)
    }

    fn ctx() -> FetchContext {
        FetchContext {
            retries: 2,
            ..FetchContext::default()
        }
    }

    #[tokio::test]
    async fn file_url_fetch_verify_expand() {
        let dir = tempfile::tempdir().unwrap();
        let (tar, digest) = tarball(dir.path());
        let fetcher = UrlFetch::new(format!("file://{}", tar.display()), digest);
        let stage = Stage::new(dir.path().join("stage"));

        fetcher.fetch(&stage, &ctx()).await.unwrap();
        fetcher.verify(&stage).await.unwrap();
        fetcher.expand(&stage).await.unwrap();
        assert_eq!(std::fs::read_to_string(stage.source_path().join("README")).unwrap(), "hello\n");
        assert!(!stage.path().join("hello-1.0.tar.gz.part").exists());

        // idempotent
        fetcher.fetch(&stage, &ctx()).await.unwrap();
        fetcher.expand(&stage).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_checksum_deletes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (tar, _) = tarball(dir.path());
        let wrong = Sha256Digest::of_bytes(b"something else");
        let fetcher = UrlFetch::new(format!("file://{}", tar.display()), wrong.clone());
        let stage = Stage::new(dir.path().join("stage"));

        fetcher.fetch(&stage, &ctx()).await.unwrap();
        let err = fetcher.verify(&stage).await.unwrap_err();
        match &err {
            FetchError::ChecksumMismatch { expected, .. } => assert_eq!(expected, &wrong),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.kind(), "ChecksumMismatch");
        assert!(!fetcher.archive_path(&stage).exists());
        assert!(matches!(fetcher.expand(&stage).await, Err(FetchError::NoArchive(_))));
    }

    #[tokio::test]
    async fn reset_then_expand_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let (tar, digest) = tarball(dir.path());
        let fetcher = UrlFetch::new(format!("file://{}", tar.display()), digest);
        let stage = Stage::new(dir.path().join("stage"));
        fetcher.fetch(&stage, &ctx()).await.unwrap();
        fetcher.expand(&stage).await.unwrap();

        let snapshot = || {
            let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(stage.source_path())
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| {
                    let rel = e.path().strip_prefix(stage.source_path()).unwrap();
                    (rel.display().to_string(), std::fs::read(e.path()).unwrap())
                })
                .collect();
            files.sort();
            files
        };
        let pristine = snapshot();

        for _ in 0..2 {
            std::fs::write(stage.source_path().join("build.o"), b"junk").unwrap();
            std::fs::write(stage.source_path().join("README"), b"edited").unwrap();
            fetcher.reset(&stage, &ctx()).await.unwrap();
            fetcher.expand(&stage).await.unwrap();
            assert_eq!(snapshot(), pristine);
        }
        assert!(fetcher.archive_path(&stage).is_file());
    }

    #[tokio::test]
    async fn http_download() {
        let body = b"plain archive bytes".to_vec();
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/pkg-1.0.tar")
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = UrlFetch::new(format!("{}/pkg-1.0.tar", server.url()), Sha256Digest::of_bytes(&body));
        let stage = Stage::new(dir.path().join("stage"));
        fetcher.fetch(&stage, &ctx()).await.unwrap();
        fetcher.verify(&stage).await.unwrap();
        fetcher.fetch(&stage, &ctx()).await.unwrap();
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_fail() {
        let mut server = mockito::Server::new_async().await;
        let flaky = server
            .mock("GET", "/pkg-1.0.tar")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = UrlFetch::new(format!("{}/pkg-1.0.tar", server.url()), Sha256Digest::of_bytes(b""));
        let stage = Stage::new(dir.path().join("stage"));
        let err = fetcher.fetch(&stage, &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "FetchFailed");
        assert!(!stage.path().join("pkg-1.0.tar.part").exists());
        flaky.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/gone.tar.gz")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = UrlFetch::new(format!("{}/gone.tar.gz", server.url()), Sha256Digest::of_bytes(b""));
        let stage = Stage::new(dir.path().join("stage"));
        let err = fetcher.fetch(&stage, &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "FetchFailed");
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn html_response_only_warns() {
        let body = b"<!DOCTYPE html><html><body>mirror error</body></html>".to_vec();
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/pkg.tar.gz")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(body.clone())
            .create_async()
            .await;

        let warnings = Arc::new(Warnings::default());
        let ctx = FetchContext {
            reporter: warnings.clone(),
            ..ctx()
        };
        let dir = tempfile::tempdir().unwrap();
        let fetcher = UrlFetch::new(format!("{}/pkg.tar.gz", server.url()), Sha256Digest::of_bytes(&body));
        let stage = Stage::new(dir.path().join("stage"));
        fetcher.fetch(&stage, &ctx).await.unwrap();
        assert!(fetcher.archive_path(&stage).is_file());
        assert_eq!(warnings.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn html_sniffing() {
        assert!(looks_like_html(b"  \n<!doctype HTML>"));
        assert!(looks_like_html(b"<html lang=en>"));
        assert!(!looks_like_html(&[0x1f, 0x8b, 0x08]));
    }
}
