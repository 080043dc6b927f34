use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::integrity::{self, HashDigest};
use crate::signature;
use crate::util;

/// Fetches artifacts over HTTP(S) or from local `file://` sources, composing
/// hash and signature verification with a cache-aware download policy.
///
/// A single `Downloader` (behind an `Arc`) is shared by every concurrent task
/// in a batch; the per-batch concurrency width is enforced by the semaphore
/// handed out by [`Downloader::limiter`].
pub struct Downloader {
    client: reqwest::Client,
    num_jobs: usize,
    warn_signature: bool,
    verifier: signature::Verifier,
}

impl Downloader {
    pub fn new(num_jobs: usize, timeout_seconds: u64) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_seconds));
        }
        Ok(Self {
            client: builder.build()?,
            num_jobs: num_jobs.max(1),
            warn_signature: false,
            verifier: signature::Verifier::new(),
        })
    }

    /// Demote signature-verification failures to warnings.
    pub fn set_warn_signature(&mut self, warn_signature: bool) {
        self.warn_signature = warn_signature;
    }

    /// Capacity limiter for one batch of concurrent fetches.
    pub fn limiter(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.num_jobs))
    }

    async fn write_stream(&self, url: &str, tmp_path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| Error::download(url, e))?;
        if url.starts_with("http:") || url.starts_with("https:") {
            let mut response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::download(url, e))?;
            loop {
                let chunk = response
                    .chunk()
                    .await
                    .map_err(|e| Error::download(url, e))?;
                let Some(chunk) = chunk else { break };
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::download(url, e))?;
            }
        } else {
            let local = url.strip_prefix("file://").unwrap_or(url);
            let mut source = tokio::fs::File::open(local)
                .await
                .map_err(|e| Error::download(url, e))?;
            tokio::io::copy(&mut source, &mut file)
                .await
                .map_err(|e| Error::download(url, e))?;
        }
        file.flush().await.map_err(|e| Error::download(url, e))?;
        Ok(())
    }

    /// Fetch `url` into `dest` through an atomically renamed `.tmp` sibling.
    /// On failure the partial file is deleted and `Download` is raised.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        if dest.is_file() {
            std::fs::remove_file(dest)?;
        }
        util::make_dirs_for(dest)?;
        let tmp_path = util::tmp_path_for(dest);
        if let Err(err) = self.write_stream(url, &tmp_path).await {
            if tmp_path.is_file() {
                let _ = std::fs::remove_file(&tmp_path);
            }
            return Err(err);
        }
        std::fs::rename(&tmp_path, dest)?;
        Ok(())
    }

    pub async fn fetch_cached(
        &self,
        url: &str,
        dest: &Path,
        cached: bool,
    ) -> Result<()> {
        if cached && dest.is_file() {
            debug!("[cached file] {}", dest.display());
        } else {
            debug!("[downloading] {}", dest.display());
            self.fetch(url, dest).await?;
        }
        Ok(())
    }

    pub fn verify_hash(&self, path: &Path, expected: &HashDigest) -> Result<()> {
        debug!("[verify] {}", path.display());
        integrity::verify_hash(path, expected)
    }

    /// Verify `path` against its `.sha256` sidecar (and `.asc` when
    /// `with_sig`).
    pub fn verify(&self, path: &Path, with_sig: bool) -> Result<()> {
        debug!("[verify] {}", path.display());
        integrity::verify(path, None)?;
        if with_sig {
            self.sig_verify(path, &signature::path_append_sig_suffix(path))?;
        }
        Ok(())
    }

    fn sig_verify(&self, path: &Path, sig_path: &Path) -> Result<()> {
        match self.verifier.verify(path, sig_path) {
            Err(err) if err.is_integrity() && self.warn_signature => {
                warn!("signature failure for {}", path.display());
                Ok(())
            }
            other => other,
        }
    }

    /// Fetch `url` into `dest` and verify it against `expected`.
    ///
    /// With `cached`, an existing file with a matching hash short-circuits
    /// the download; with `assume_ok`, mere existence does. A hash mismatch
    /// after a fresh fetch is fatal.
    pub async fn fetch_verify_hash(
        &self,
        url: &str,
        dest: &Path,
        expected: &HashDigest,
        cached: bool,
        assume_ok: bool,
    ) -> Result<()> {
        if cached {
            if assume_ok && dest.is_file() {
                trace!("[assuming OK] {}", dest.display());
                return Ok(());
            }
            match integrity::verify_hash(dest, expected) {
                Ok(()) => {
                    debug!("[cached file] {}", dest.display());
                    return Ok(());
                }
                Err(err) if err.is_integrity() => {}
                Err(err) => return Err(err),
            }
        }
        debug!("[downloading] {}", dest.display());
        self.fetch(url, dest).await?;
        integrity::verify_hash(dest, expected)
    }

    fn cached_sidecar_check(
        &self,
        dest: &Path,
        hash_path: &Path,
        sig_path: &Path,
        with_sig: bool,
    ) -> Result<()> {
        integrity::verify(dest, Some(hash_path))?;
        if with_sig {
            self.sig_verify(dest, sig_path)?;
        }
        Ok(())
    }

    /// Fetch `dest` along with its sidecar hash file (and signature when
    /// `with_sig`). The small sidecars are always fetched first; the main
    /// file is only re-fetched when it fails the sidecar's hash.
    pub async fn fetch_verify(
        &self,
        url: &str,
        dest: &Path,
        cached: bool,
        assume_ok: bool,
        with_sig: bool,
    ) -> Result<()> {
        let hash_path = integrity::path_append_hash_suffix(dest);
        let sig_path = signature::path_append_sig_suffix(dest);
        if cached {
            if assume_ok
                && dest.is_file()
                && hash_path.is_file()
                && (!with_sig || sig_path.is_file())
            {
                trace!("[assuming OK] {}", dest.display());
                return Ok(());
            }
            match self.cached_sidecar_check(dest, &hash_path, &sig_path, with_sig)
            {
                Ok(()) => {
                    debug!("[cached file] {}", dest.display());
                    return Ok(());
                }
                Err(err) if err.is_integrity() => {}
                Err(err) => return Err(err),
            }
        }
        debug!("[downloading] {}", dest.display());
        self.fetch(&integrity::append_hash_suffix(url), &hash_path)
            .await?;
        if with_sig {
            self.fetch(&signature::append_sig_suffix(url), &sig_path)
                .await?;
        }

        // An existing file matching the (fresh) sidecar hash need not be
        // transferred again.
        let mut download_required = true;
        if dest.is_file() {
            match integrity::verify(dest, Some(&hash_path)) {
                Ok(()) => download_required = false,
                Err(err) if err.is_integrity() => {}
                Err(err) => return Err(err),
            }
        }
        if download_required {
            self.fetch(url, dest).await?;
            integrity::verify(dest, Some(&hash_path))?;
        }
        if with_sig {
            self.sig_verify(dest, &sig_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn file_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn fetch_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"content").unwrap();
        let dest = dir.path().join("sub/dest.bin");

        let downloader = Downloader::new(1, 0).unwrap();
        downloader.fetch(&file_url(&src), &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"content");
        assert!(!util::tmp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn fetch_missing_source_cleans_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest.bin");

        let downloader = Downloader::new(1, 0).unwrap();
        let err = downloader
            .fetch(&file_url(&dir.path().join("no-such")), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download { .. }));
        assert!(!dest.exists());
        assert!(!util::tmp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn fetch_replaces_stale_tmp_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"content").unwrap();
        let dest = dir.path().join("dest.bin");
        fs::write(util::tmp_path_for(&dest), b"stale partial").unwrap();

        let downloader = Downloader::new(1, 0).unwrap();
        downloader.fetch(&file_url(&src), &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"content");
        assert!(!util::tmp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn fetch_verify_hash_cache_policy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"content").unwrap();
        let digest = integrity::hash_file(&src).unwrap();
        let dest = dir.path().join("dest.bin");

        let downloader = Downloader::new(1, 0).unwrap();
        downloader
            .fetch_verify_hash(&file_url(&src), &dest, &digest, true, false)
            .await
            .unwrap();

        // A cached hit must not re-read the source.
        fs::remove_file(&src).unwrap();
        downloader
            .fetch_verify_hash(&file_url(&src), &dest, &digest, true, false)
            .await
            .unwrap();

        // assume_ok accepts existence without hashing.
        fs::write(&dest, b"corrupt").unwrap();
        downloader
            .fetch_verify_hash(&file_url(&src), &dest, &digest, true, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_verify_hash_fresh_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"content").unwrap();
        let bogus: HashDigest =
            "7b89a56897a1581ca66312468276ee08e6d596a3254128a567c1658c6f733c76"
                .parse()
                .unwrap();
        let dest = dir.path().join("dest.bin");

        let downloader = Downloader::new(1, 0).unwrap();
        let err = downloader
            .fetch_verify_hash(&file_url(&src), &dest, &bogus, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn fetch_verify_skips_main_file_matching_fresh_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("artifact.toml");
        fs::write(&src, b"[pkg]").unwrap();
        let digest = integrity::hash_file(&src).unwrap();
        integrity::write_hash_file_for(&src, &digest).unwrap();

        let dest = dir.path().join("mirror/artifact.toml");
        let downloader = Downloader::new(1, 0).unwrap();
        downloader
            .fetch_verify(&file_url(&src), &dest, true, false, false)
            .await
            .unwrap();

        // With cached=false the sidecar is re-fetched, but a main file
        // already matching it is not transferred again.
        fs::remove_file(&src).unwrap();
        downloader
            .fetch_verify(&file_url(&src), &dest, false, false, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_verify_uses_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("artifact.toml");
        fs::write(&src, b"[pkg]").unwrap();
        let digest = integrity::hash_file(&src).unwrap();
        integrity::write_hash_file_for(&src, &digest).unwrap();

        let dest = dir.path().join("mirror/artifact.toml");
        let downloader = Downloader::new(1, 0).unwrap();
        downloader
            .fetch_verify(&file_url(&src), &dest, true, false, false)
            .await
            .unwrap();
        assert!(dest.is_file());
        assert!(integrity::path_append_hash_suffix(&dest).is_file());
        downloader.verify(&dest, false).unwrap();
    }
}
