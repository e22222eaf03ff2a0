//! Runtime image freshness.
//!
//! The worker keeps one SIF image on disk plus a digest sidecar recording the
//! OCI manifest digest it was built from. Refreshing means: resolve the
//! remote digest, compare with the sidecar, and only pull on mismatch. The
//! image file is replaced by atomic rename and the sidecar is written last,
//! so readers never see a digest describing a half-installed image.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;

use crate::config::Config;
use crate::error::{HpcqError, Result};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    /// Tag when floating, pinned digest when the reference carries one.
    pub tag: String,
    pub digest: Option<String>,
}

impl OciReference {
    /// Parse `registry/repo[:tag]` or `registry/repo@sha256:…`. Bare
    /// Docker-Hub style names (`alpine`, `library/alpine`) resolve against
    /// `registry-1.docker.io`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().trim_start_matches("docker://");
        if raw.is_empty() {
            return Err(HpcqError::InvalidConfig("empty OCI reference".to_string()));
        }

        let (registry, rest) = match raw.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), rest.to_string())
            }
            _ => ("registry-1.docker.io".to_string(), raw.to_string()),
        };

        let (repo_and_tag, digest) = match rest.split_once('@') {
            Some((repo, digest)) => (repo.to_string(), Some(digest.to_string())),
            None => (rest, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port and cannot appear here.
        let (repository, tag) = match repo_and_tag.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (repo_and_tag, "latest".to_string()),
        };

        if repository.is_empty() {
            return Err(HpcqError::InvalidConfig(format!("OCI reference has no repository: {raw}")));
        }

        Ok(Self { registry, repository, tag, digest })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Sidecar matches the remote digest and the image file exists.
    Fresh,
    /// A new image was pulled and installed.
    Updated,
    /// Remote state could not be resolved; the existing image is used as-is.
    StaleFallback,
    /// Probe skipped because the last successful check is recent.
    Skipped,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct ImageRefresher {
    http: reqwest::Client,
    apptainer_bin: String,
    image_path: PathBuf,
    oci_ref: Option<String>,
    sif_url: Option<String>,
    credentials: Option<(String, String)>,
    refresh_interval: Duration,
}

impl ImageRefresher {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(HpcqError::Http)?;
        Ok(Self {
            http,
            apptainer_bin: config.apptainer_bin.clone(),
            image_path: config.apptainer_image.clone(),
            oci_ref: config.apptainer_oci_ref.clone(),
            sif_url: config.apptainer_sif_url.clone(),
            credentials: match (&config.registry_user, &config.registry_password) {
                (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                _ => None,
            },
            refresh_interval: Duration::from_secs(config.image_refresh_hours * 3600),
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    fn sidecar_path(&self) -> PathBuf {
        let mut name = self.image_path.as_os_str().to_owned();
        name.push(".digest");
        PathBuf::from(name)
    }

    async fn image_exists(&self) -> bool {
        fs::metadata(&self.image_path).await.is_ok()
    }

    /// Blocking startup refresh: must leave a usable image behind or fail.
    pub async fn ensure_fresh(&self) -> Result<RefreshOutcome> {
        match self.refresh_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(err) if self.image_exists().await => {
                tracing::warn!(error = %err, "Image refresh failed, continuing with local image");
                Ok(RefreshOutcome::StaleFallback)
            }
            Err(err) => {
                tracing::warn!(error = %err, "No local image; attempting unconditional pull");
                self.pull_and_install(None).await?;
                Ok(RefreshOutcome::Updated)
            }
        }
    }

    /// Pre-job probe: never fails the job while a usable image exists, and
    /// skips the network round-trip entirely when the last successful check
    /// is younger than the refresh interval.
    pub async fn refresh_best_effort(&self) -> Result<RefreshOutcome> {
        if self.image_exists().await && self.recently_checked().await {
            return Ok(RefreshOutcome::Skipped);
        }
        match self.refresh_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if self.image_exists().await {
                    tracing::warn!(error = %err, "Pre-job image probe failed, using current image");
                    Ok(RefreshOutcome::StaleFallback)
                } else {
                    Err(HpcqError::ImageUnavailable(self.image_path.display().to_string()))
                }
            }
        }
    }

    async fn recently_checked(&self) -> bool {
        match fs::metadata(self.sidecar_path()).await.and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age < self.refresh_interval,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    async fn refresh_inner(&self) -> Result<RefreshOutcome> {
        let remote_digest = self.resolve_remote_digest().await?;

        let local_digest = fs::read_to_string(self.sidecar_path())
            .await
            .ok()
            .map(|s| s.trim().to_string());

        if local_digest.as_deref() == Some(remote_digest.as_str()) && self.image_exists().await {
            tracing::debug!(digest = %remote_digest, "Runtime image already current");
            // Record the successful check so the pre-job guard can skip.
            fs::write(self.sidecar_path(), format!("{remote_digest}\n")).await?;
            return Ok(RefreshOutcome::Fresh);
        }

        tracing::info!(
            remote = %remote_digest,
            local = local_digest.as_deref().unwrap_or("<none>"),
            "Runtime image digest changed, pulling"
        );
        self.pull_and_install(Some(&remote_digest)).await?;
        Ok(RefreshOutcome::Updated)
    }

    /// Resolve the manifest digest the reference currently points at.
    pub async fn resolve_remote_digest(&self) -> Result<String> {
        let raw_ref = self
            .oci_ref
            .as_deref()
            .ok_or_else(|| HpcqError::ImageRefresh("APPTAINER_OCI_REF is not set".to_string()))?;
        let reference = OciReference::parse(raw_ref)?;

        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let token = self.fetch_pull_token(&reference).await?;
        let manifest_url = format!(
            "{}/v2/{}/manifests/{}",
            registry_base(&reference.registry),
            reference.repository,
            reference.tag
        );

        // HEAD first; some registries only emit the digest header on GET.
        for method in [reqwest::Method::HEAD, reqwest::Method::GET] {
            let mut request = self
                .http
                .request(method.clone(), &manifest_url)
                .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            let resp = request.send().await?;
            if !resp.status().is_success() {
                if method == reqwest::Method::GET {
                    return Err(HpcqError::ImageRefresh(format!(
                        "manifest request for {manifest_url} returned {}",
                        resp.status()
                    )));
                }
                continue;
            }
            if let Some(digest) = resp
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|v| v.to_str().ok())
            {
                return Ok(digest.to_string());
            }
        }

        Err(HpcqError::ImageRefresh(format!(
            "registry did not return Docker-Content-Digest for {manifest_url}"
        )))
    }

    /// Pull-scoped registry token. `None` when the registry serves `/v2/`
    /// unauthenticated.
    async fn fetch_pull_token(&self, reference: &OciReference) -> Result<Option<String>> {
        let probe_url = format!("{}/v2/", registry_base(&reference.registry));
        let probe = self.http.get(&probe_url).send().await?;
        if probe.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let challenge = probe
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let realm = challenge_param(&challenge, "realm").ok_or_else(|| {
            HpcqError::ImageRefresh(format!("registry challenge missing realm: {challenge}"))
        })?;
        let service = challenge_param(&challenge, "service");

        let mut token_url = format!(
            "{realm}?scope=repository:{}:pull",
            reference.repository
        );
        if let Some(service) = service {
            token_url.push_str(&format!("&service={service}"));
        }

        let mut request = self.http.get(&token_url);
        if let Some((user, pass)) = &self.credentials {
            let basic = BASE64.encode(format!("{user}:{pass}"));
            request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"));
        }
        let resp: TokenResponse = request.send().await?.error_for_status()?.json().await?;
        resp.token
            .or(resp.access_token)
            .map(Some)
            .ok_or_else(|| HpcqError::ImageRefresh("token endpoint returned no token".to_string()))
    }

    /// Pull the image to `<image>.tmp`, rename into place, then write the
    /// sidecar. The sidecar is written last; a crash mid-pull leaves the old
    /// image and old sidecar intact.
    async fn pull_and_install(&self, digest: Option<&str>) -> Result<()> {
        if let Some(parent) = self.image_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = {
            let mut name = self.image_path.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };

        if let Some(url) = &self.sif_url {
            self.download_sif(url, &tmp_path).await?;
        } else {
            self.apptainer_pull(&tmp_path).await?;
        }

        fs::rename(&tmp_path, &self.image_path).await?;

        let digest_line = match digest {
            Some(d) => d.to_string(),
            // Unconditional pull without a resolved digest: re-resolve if we
            // can so the next probe has a baseline; otherwise leave no
            // sidecar and force a probe next time.
            None => match self.resolve_remote_digest().await {
                Ok(d) => d,
                Err(_) => return Ok(()),
            },
        };
        fs::write(self.sidecar_path(), format!("{digest_line}\n")).await?;
        Ok(())
    }

    async fn download_sif(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!(url, dest = %dest.display(), "Downloading runtime image");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn apptainer_pull(&self, dest: &Path) -> Result<()> {
        let raw_ref = self
            .oci_ref
            .as_deref()
            .ok_or_else(|| HpcqError::ImageRefresh("no OCI reference or SIF URL to pull from".to_string()))?;
        let source = if raw_ref.starts_with("docker://") {
            raw_ref.to_string()
        } else {
            format!("docker://{raw_ref}")
        };

        tracing::info!(source = %source, dest = %dest.display(), "Converting OCI image to SIF");
        let output = Command::new(&self.apptainer_bin)
            .arg("pull")
            .arg("--force")
            .arg(dest)
            .arg(&source)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| HpcqError::ImageRefresh(format!("failed to run {}: {e}", self.apptainer_bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HpcqError::ImageRefresh(format!(
                "{} pull exited {:?}: {}",
                self.apptainer_bin,
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Loopback registries are plain HTTP, everything else is HTTPS.
fn registry_base(registry: &str) -> String {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" {
        format!("http://{registry}")
    } else {
        format!("https://{registry}")
    }
}

fn challenge_param(challenge: &str, key: &str) -> Option<String> {
    challenge.split(',').find_map(|part| {
        let (k, v) = part.split_once('=')?;
        if k.trim().trim_start_matches("Bearer ").trim() == key {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}
