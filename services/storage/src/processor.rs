use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use serde_json::json;
use thiserror::Error;
use tierflow_pipeline::{Classify, ErrorClass, StorageEvent};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// Errors raised while turning an object into resources
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Failed to fetch {bucket}/{key}: {message}")]
    Fetch {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Content extraction failed: {0}")]
    Extraction(String),
}

impl Classify for ProcessingError {
    fn class(&self) -> ErrorClass {
        match self {
            ProcessingError::Fetch { .. } => ErrorClass::TransientInfra,
            ProcessingError::NotFound { .. } | ProcessingError::Extraction(_) => {
                ErrorClass::Processing
            }
        }
    }
}

/// One piece of extracted content
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedResource {
    pub name: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Result of processing one file
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub content_type: Option<String>,
    pub bytes_read: u64,
    pub resources: Vec<ExtractedResource>,
}

/// Content-extraction capability used by the workers
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn process(&self, event: &StorageEvent) -> Result<ProcessedFile, ProcessingError>;
}

/// Fetches objects from S3-compatible storage and splits text into chunks
pub struct ObjectContentProcessor {
    client: S3Client,
    config: S3Config,
}

impl ObjectContentProcessor {
    /// Create a new processor with its own S3 client
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for SeaweedFS/MinIO
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = ?config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "Object content processor initialized"
        );

        Self {
            client,
            config: config.clone(),
        }
    }

    /// Bucket and key of the object an event refers to
    pub fn object_location(&self, event: &StorageEvent) -> (String, String) {
        object_location(self.config.bucket.as_deref(), event)
    }

    fn metadata_only(event: &StorageEvent, reason: &str) -> ExtractedResource {
        ExtractedResource {
            name: file_name(&event.relative_path),
            content: String::new(),
            metadata: json!({
                "extraction": reason,
                "size_bytes": event.metadata.file_size,
                "content_type": event.metadata.content_type,
                "etag": event.metadata.etag,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ContentProcessor for ObjectContentProcessor {
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, path = %event.relative_path))]
    async fn process(&self, event: &StorageEvent) -> Result<ProcessedFile, ProcessingError> {
        if event.metadata.file_size > self.config.max_extract_bytes {
            debug!(size = event.metadata.file_size, "Object too large for extraction");
            return Ok(ProcessedFile {
                content_type: event.metadata.content_type.clone(),
                bytes_read: 0,
                resources: vec![Self::metadata_only(event, "skipped_size")],
            });
        }

        let (bucket, key) = self.object_location(event);
        let response = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    ProcessingError::NotFound {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    }
                } else {
                    ProcessingError::Fetch {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        message: service_error.to_string(),
                    }
                }
            })?;

        let content_type = response
            .content_type()
            .map(str::to_string)
            .or_else(|| event.metadata.content_type.clone());

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ProcessingError::Fetch {
                bucket: bucket.clone(),
                key: key.clone(),
                message: e.to_string(),
            })?
            .into_bytes();

        let resources = match std::str::from_utf8(&body) {
            Ok(text) if is_textual(content_type.as_deref()) => {
                let name = file_name(&event.relative_path);
                chunk_text(text, self.config.chunk_chars)
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| ExtractedResource {
                        name: format!("{}#{}", name, i),
                        content: chunk,
                        metadata: json!({ "extraction": "text", "chunk": i }),
                    })
                    .collect()
            }
            _ => vec![Self::metadata_only(event, "binary")],
        };

        debug!(bytes = body.len(), resources = resources.len(), "Object processed");

        Ok(ProcessedFile {
            content_type,
            bytes_read: body.len() as u64,
            resources,
        })
    }
}

/// SeaweedFS exposes `buckets/<tenant>/<path>` as bucket `<tenant>`, key
/// `<path>`. A configured bucket takes the full path as key instead.
pub fn object_location(bucket: Option<&str>, event: &StorageEvent) -> (String, String) {
    match bucket {
        Some(bucket) => (
            bucket.to_string(),
            event.path.trim_start_matches('/').to_string(),
        ),
        None => (event.tenant_id.clone(), event.relative_path.clone()),
    }
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Text unless the content type says otherwise. Unknown types fall back to
/// the UTF-8 check done by the caller.
fn is_textual(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("yaml")
                || ct.contains("javascript")
                || ct == "application/octet-stream"
        }
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring to
/// break after a newline or whitespace. Empty text yields no chunks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let end = match rest.char_indices().nth(max_chars) {
            None => rest.len(),
            Some((limit, _)) => {
                let window = &rest[..limit];
                window
                    .rfind('\n')
                    .or_else(|| window.rfind(char::is_whitespace))
                    .map(|i| i + window[i..].chars().next().map_or(1, char::len_utf8))
                    .filter(|i| *i > 0)
                    .unwrap_or(limit)
            }
        };
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    chunks
}
