// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::Semaphore;

use crate::modules::cache::ContentCache;
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::message::{AttachmentSpec, FetchMode};
use crate::modules::tenant::Tenant;
use crate::modules::utils::sha256_hex;
use crate::{base64_decode, raise_error};

pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Legacy content-hash marker embedded in filenames, e.g.
/// `report_{MD5:a1b2c3}.pdf`. The hash keys the cache lookup; the marker is
/// stripped from the emitted filename.
static HASH_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{MD5:([a-fA-F0-9]+)\}").unwrap());

#[derive(Clone, Debug)]
pub struct ResolvedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Arc<Vec<u8>>,
}

/// Materializes attachment contents from their descriptors: inline base64,
/// the local filesystem, plain HTTP GET, or a POST against the tenant's
/// attachment endpoint. Fetched content flows through the two-tier cache.
pub struct AttachmentResolver {
    http: reqwest::Client,
    cache: Arc<ContentCache>,
    base_dir: Option<PathBuf>,
    fetch_timeout: Duration,
    max_concurrent: usize,
}

impl AttachmentResolver {
    pub fn new(
        cache: Arc<ContentCache>,
        base_dir: Option<PathBuf>,
        fetch_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache,
            base_dir,
            fetch_timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Strip the hash marker from a filename, returning the clean name and
    /// the lowercase hash when present.
    pub fn parse_filename(filename: &str) -> (String, Option<String>) {
        let Some(captures) = HASH_MARKER.captures(filename) else {
            return (filename.to_string(), None);
        };
        let hash = captures[1].to_lowercase();
        let mut clean = HASH_MARKER.replace_all(filename, "").to_string();
        while clean.contains("__") {
            clean = clean.replace("__", "_");
        }
        clean = clean.trim_matches('_').to_string();
        clean = clean.replace("_.", ".");
        (clean, Some(hash))
    }

    /// Resolve every descriptor of one message, at most `max_concurrent` at
    /// a time. Messages without attachments never touch the semaphore. Any
    /// single failure fails the whole set.
    pub async fn resolve_all(
        &self,
        specs: &[AttachmentSpec],
        tenant: Option<&Tenant>,
    ) -> RelayMailResult<Vec<ResolvedAttachment>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        futures::future::try_join_all(specs.iter().map(|spec| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                self.resolve_one(spec, tenant).await
            }
        }))
        .await
    }

    async fn resolve_one(
        &self,
        spec: &AttachmentSpec,
        tenant: Option<&Tenant>,
    ) -> RelayMailResult<ResolvedAttachment> {
        let (filename, marker) = Self::parse_filename(&spec.filename);
        let content = match marker {
            Some(key) => {
                self.cache
                    .get_or_fetch(&key, || self.fetch(spec, tenant))
                    .await?
            }
            None => {
                // Without a marker the key is only known after the fetch,
                // so the single-flight path does not apply.
                let bytes = self.fetch(spec, tenant).await?;
                let key = sha256_hex(&bytes);
                let content = Arc::new(bytes);
                self.cache.store(&key, content.clone()).await;
                content
            }
        };
        Ok(ResolvedAttachment {
            mime_type: resolve_mime(spec.mime_type.as_deref(), &filename),
            filename,
            content,
        })
    }

    async fn fetch(
        &self,
        spec: &AttachmentSpec,
        tenant: Option<&Tenant>,
    ) -> RelayMailResult<Vec<u8>> {
        tokio::time::timeout(self.fetch_timeout, self.fetch_inner(spec, tenant))
            .await
            .map_err(|_| {
                raise_error!(
                    format!("Attachment '{}' fetch timed out", spec.filename),
                    ErrorCode::AttachmentFetchFailed
                )
            })?
    }

    async fn fetch_inner(
        &self,
        spec: &AttachmentSpec,
        tenant: Option<&Tenant>,
    ) -> RelayMailResult<Vec<u8>> {
        match spec.effective_mode() {
            FetchMode::Base64 => {
                let literal = spec
                    .storage_path
                    .strip_prefix("base64:")
                    .unwrap_or(&spec.storage_path);
                base64_decode!(literal).map_err(|e| {
                    raise_error!(
                        format!("Invalid base64 attachment '{}': {:#?}", spec.filename, e),
                        ErrorCode::AttachmentFetchFailed
                    )
                })
            }
            FetchMode::Filesystem => self.read_local_file(&spec.storage_path).await,
            FetchMode::HttpUrl => {
                let response = self
                    .http
                    .get(&spec.storage_path)
                    .send()
                    .await
                    .map_err(|e| {
                        raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed)
                    })?;
                Self::read_response(response, &spec.filename).await
            }
            FetchMode::Endpoint => {
                let tenant = tenant.ok_or_else(|| {
                    raise_error!(
                        format!(
                            "Attachment '{}' requires a tenant attachment endpoint",
                            spec.filename
                        ),
                        ErrorCode::MissingConfiguration
                    )
                })?;
                let url = tenant.attachment_url().ok_or_else(|| {
                    raise_error!(
                        format!("Tenant '{}' has no attachment endpoint", tenant.id),
                        ErrorCode::MissingConfiguration
                    )
                })?;
                let auth = spec.auth.as_ref().unwrap_or(&tenant.auth);
                let request = auth.apply(self.http.post(&url)).body(spec.storage_path.clone());
                let response = request.send().await.map_err(|e| {
                    raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed)
                })?;
                Self::read_response(response, &spec.filename).await
            }
        }
    }

    async fn read_local_file(&self, storage_path: &str) -> RelayMailResult<Vec<u8>> {
        let requested = Path::new(storage_path);
        let path = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            let base = self.base_dir.as_ref().ok_or_else(|| {
                raise_error!(
                    format!(
                        "Relative attachment path '{}' requires a configured base directory",
                        storage_path
                    ),
                    ErrorCode::MissingConfiguration
                )
            })?;
            let base = tokio::fs::canonicalize(base).await.map_err(|e| {
                raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed)
            })?;
            let joined = tokio::fs::canonicalize(base.join(requested))
                .await
                .map_err(|e| {
                    raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed)
                })?;
            if !joined.starts_with(&base) {
                return Err(raise_error!(
                    format!("Attachment path '{}' escapes the base directory", storage_path),
                    ErrorCode::InvalidParameter
                ));
            }
            joined
        };
        tokio::fs::read(&path)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed))
    }

    async fn read_response(
        response: reqwest::Response,
        filename: &str,
    ) -> RelayMailResult<Vec<u8>> {
        if !response.status().is_success() {
            return Err(raise_error!(
                format!(
                    "Attachment '{}' fetch returned {}",
                    filename,
                    response.status()
                ),
                ErrorCode::AttachmentFetchFailed
            ));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::AttachmentFetchFailed))?
            .to_vec())
    }
}

/// Explicit descriptor field, else the filename extension, else the
/// octet-stream fallback.
fn resolve_mime(explicit: Option<&str>, filename: &str) -> String {
    if let Some(mime) = explicit {
        if mime.contains('/') {
            return mime.to_string();
        }
    }
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}
