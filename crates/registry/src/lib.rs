// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Remote pack registry client
//!
//! A thin HTTPS client for the chef registry: pack metadata lookup,
//! downloads into the local pack store, and uploads of freshly baked
//! packs. Downloads retry with bounded backoff; verification failures
//! never do.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use proof::{PackageProof, PublisherProof};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use url::Url;

const USER_AGENT: &str = concat!("chef/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_ATTEMPTS: u32 = 3;
const BACKOFF_START: Duration = Duration::from_millis(500);

/// Latest pack revision available for a (publisher, package, channel)
#[derive(Debug, Clone, Deserialize)]
pub struct PackMetadata {
    pub publisher: String,
    pub package: String,
    pub channel: String,
    pub platform: String,
    pub arch: String,
    pub revision: u64,
    pub size: u64,
}

/// Proof records accompanying a pack
#[derive(Debug, Clone, Deserialize)]
pub struct Proofs {
    pub publisher: PublisherProof,
    pub package: PackageProof,
}

#[derive(Debug, Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: Url) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(TIMEOUT)
            .build()?;

        Ok(Self { base, http })
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    pub async fn metadata(
        &self,
        publisher: &str,
        package: &str,
        channel: &str,
        platform: &str,
        arch: &str,
    ) -> Result<PackMetadata, Error> {
        let url = self.url(&format!("v1/packs/{publisher}/{package}"))?;

        let response = self
            .http
            .get(url)
            .query(&[("channel", channel), ("platform", platform), ("arch", arch)])
            .send()
            .await?;

        Ok(Self::checked(response)?.json().await?)
    }

    pub async fn proofs(&self, publisher: &str, package: &str, revision: u64) -> Result<Proofs, Error> {
        let url = self.url(&format!("v1/proofs/{publisher}/{package}/{revision}"))?;

        let response = self.http.get(url).send().await?;

        Ok(Self::checked(response)?.json().await?)
    }

    /// Stream a pack into `dest`, reporting every chunk through the
    /// observer as `(bytes_current, bytes_total)`. Transient failures
    /// retry with doubling backoff.
    pub async fn download_pack(
        &self,
        metadata: &PackMetadata,
        dest: &Path,
        mut observer: impl FnMut(u64, u64),
    ) -> Result<PathBuf, Error> {
        let mut attempt = 0;
        let mut backoff = BACKOFF_START;

        loop {
            attempt += 1;

            match self.download_once(metadata, dest, &mut observer).await {
                Ok(path) => return Ok(path),
                Err(e) if attempt < DOWNLOAD_ATTEMPTS && e.transient() => {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        metadata: &PackMetadata,
        dest: &Path,
        observer: &mut impl FnMut(u64, u64),
    ) -> Result<PathBuf, Error> {
        let url = self.url(&format!(
            "v1/packs/{}/{}/{}/download",
            metadata.publisher, metadata.package, metadata.revision
        ))?;

        let response = Self::checked(
            self.http
                .get(url)
                .query(&[("platform", &metadata.platform), ("arch", &metadata.arch)])
                .send()
                .await?,
        )?;

        let total = response.content_length().unwrap_or(metadata.size);

        if let Some(parent) = dest.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }

        let partial = dest.with_extension("part");
        let mut file = fs_err::tokio::File::create(&partial).await?;

        let mut current = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            current += chunk.len() as u64;
            observer(current, total);
        }

        file.flush().await?;
        drop(file);

        fs_err::tokio::rename(&partial, dest).await?;

        Ok(dest.to_path_buf())
    }

    /// Upload a pack and its package proof for publishing
    pub async fn upload_pack(
        &self,
        publisher: &str,
        package: &str,
        revision: u64,
        pack: &Path,
    ) -> Result<(), Error> {
        let url = self.url(&format!("v1/packs/{publisher}/{package}/{revision}"))?;

        let file = fs_err::tokio::File::open(pack).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let response = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;

        Self::checked(response)?;
        Ok(())
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base.join(path).map_err(|_| Error::MalformedEndpoint)
    }

    fn checked(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(Error::NotFound)
        } else {
            Err(Error::Status(status.as_u16()))
        }
    }
}

/// Fetch an arbitrary url into `dest`. Used for url-sourced ingredients
/// that bypass the registry entirely.
pub async fn download_url(url: &Url, dest: &Path) -> Result<(), Error> {
    let http = reqwest::Client::builder().user_agent(USER_AGENT).timeout(TIMEOUT).build()?;

    let response = http.get(url.clone()).send().await?;
    let response = Client::checked(response)?;

    if let Some(parent) = dest.parent() {
        fs_err::tokio::create_dir_all(parent).await?;
    }

    let mut file = fs_err::tokio::File::create(dest).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registry endpoint cannot be joined")]
    MalformedEndpoint,
    #[error("not known to the registry")]
    NotFound,
    #[error("registry answered http status {0}")]
    Status(u16),
    #[error("http")]
    Http(#[from] reqwest::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Worth retrying with backoff
    pub fn transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Status(status) => *status >= 500,
            _ => false,
        }
    }
}
