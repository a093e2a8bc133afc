//! Operations shared by the OpenDAL-backed providers (S3, MinIO, GCS).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use opendal::{ErrorKind, Metadata, Operator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::fs::backend::{ContentReader, ContentWriter};
use crate::fs::types::{meta_keys, ObjectMetadata, RemoteFileInfo};

const READ_CHUNK: usize = 64 * 1024;

/// Normalize a key for OpenDAL (no leading slash).
pub(crate) fn clean_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Turn a prefix into a directory path OpenDAL can list.
pub(crate) fn list_root(prefix: &str) -> String {
    let prefix = clean_key(prefix);
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Prefer a real object version, then the ETag without quotes.
pub(crate) fn version_of(meta: &Metadata) -> String {
    meta.version()
        .map(str::to_string)
        .or_else(|| meta.etag().map(|e| e.trim_matches('"').to_string()))
        .unwrap_or_default()
}

/// Parse a timestamp rendered either as RFC3339 or as `YYYY-MM-DD HH:MM:SS UTC`.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let trimmed = raw.trim().trim_end_matches("UTC").trim_end();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn last_modified_of(meta: &Metadata) -> Option<DateTime<Utc>> {
    meta.last_modified()
        .and_then(|ts| parse_timestamp(&ts.to_string()))
}

pub(crate) async fn upload(
    operator: &Operator,
    key: &str,
    content: ContentReader<'_>,
    metadata: &ObjectMetadata,
) -> Result<String> {
    let key = clean_key(key);

    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = content
            .read(&mut chunk)
            .await
            .context("Failed to read upload body")?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let content_type = metadata
        .get(meta_keys::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    operator
        .write_with(key, body)
        .content_type(&content_type)
        .user_metadata(metadata.clone())
        .await
        .with_context(|| format!("Failed to write object {}", key))?;

    let meta = operator
        .stat(key)
        .await
        .with_context(|| format!("Failed to stat uploaded object {}", key))?;

    Ok(version_of(&meta))
}

pub(crate) async fn download(
    operator: &Operator,
    key: &str,
    output: ContentWriter<'_>,
    version_id: Option<&str>,
) -> Result<ObjectMetadata> {
    let key = clean_key(key);
    let versioned = version_id.filter(|v| {
        !v.is_empty() && operator.info().full_capability().read_with_version
    });

    let (content, meta) = match versioned {
        Some(version) => {
            let content = operator
                .read_with(key)
                .version(version)
                .await
                .with_context(|| format!("Failed to read object {}@{}", key, version))?;
            let meta = operator
                .stat_with(key)
                .version(version)
                .await
                .with_context(|| format!("Failed to stat object {}@{}", key, version))?;
            (content, meta)
        }
        None => {
            if let Some(version) = version_id {
                debug!(key, version, "Provider cannot read by version, using latest");
            }
            let content = operator
                .read(key)
                .await
                .with_context(|| format!("Failed to read object {}", key))?;
            let meta = operator
                .stat(key)
                .await
                .with_context(|| format!("Failed to stat object {}", key))?;
            (content, meta)
        }
    };

    output
        .write_all(&content.to_vec())
        .await
        .context("Failed to write downloaded content")?;
    output.flush().await?;

    Ok(meta.user_metadata().cloned().unwrap_or_default())
}

pub(crate) async fn delete(operator: &Operator, key: &str) -> Result<()> {
    let key = clean_key(key);
    operator
        .delete(key)
        .await
        .with_context(|| format!("Failed to delete object {}", key))?;
    Ok(())
}

pub(crate) async fn list(operator: &Operator, prefix: &str) -> Result<Vec<RemoteFileInfo>> {
    let root = list_root(prefix);
    let entries = operator
        .list_with(&root)
        .recursive(true)
        .await
        .with_context(|| format!("Failed to list prefix '{}'", root))?;

    let mut result = Vec::new();
    for entry in entries {
        if entry.metadata().mode().is_dir() {
            continue;
        }
        let key = entry.path().to_string();

        // Some services omit timestamps from listings; fall back to stat.
        let (size, last_modified, etag) = match last_modified_of(entry.metadata()) {
            Some(modified) => (
                entry.metadata().content_length(),
                modified,
                version_of(entry.metadata()),
            ),
            None => {
                let meta = operator
                    .stat(&key)
                    .await
                    .with_context(|| format!("Failed to stat object {}", key))?;
                (
                    meta.content_length(),
                    last_modified_of(&meta).unwrap_or_else(Utc::now),
                    version_of(&meta),
                )
            }
        };

        result.push(RemoteFileInfo {
            key,
            size,
            last_modified,
            etag,
        });
    }

    result.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(result)
}

pub(crate) async fn exists(operator: &Operator, key: &str) -> Result<bool> {
    match operator.stat(clean_key(key)).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to stat object {}", key)),
    }
}
