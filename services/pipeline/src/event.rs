//! Storage event model.
//!
//! Raw change notifications arrive as loosely shaped JSON objects from the
//! object store. [`StorageEvent::from_raw_event`] normalizes field aliases,
//! parses the tenant path and validates it; [`StorageEvent::should_process`]
//! decides whether the event enters the content pipeline at all.

use crate::error::{Classify, ErrorClass};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Root bucket under which every tenant owns a directory
pub const TENANT_BUCKET: &str = "buckets";

/// Query marker present on keys of multipart uploads that are still in progress
pub const MULTIPART_UPLOAD_MARKER: &str = "uploadId=";

/// Errors produced while turning a raw notification into a [`StorageEvent`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Event payload is not a JSON object")]
    NotAnObject,

    #[error("No path found in event data")]
    MissingPath,

    #[error("No event type found in event data")]
    MissingEventType,

    #[error("Non-tenant paths not supported: {0}")]
    NonTenantPath(String),

    #[error("Directory events not supported: {0}")]
    DirectoryEvent(String),

    #[error("Invalid file size: {0}")]
    InvalidFileSize(String),
}

impl EventError {
    /// Short label used for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            EventError::InvalidPayload(_) | EventError::NotAnObject => "invalid_payload",
            EventError::MissingPath => "missing_path",
            EventError::MissingEventType => "missing_event_type",
            EventError::NonTenantPath(_) => "non_tenant_path",
            EventError::DirectoryEvent(_) => "directory_event",
            EventError::InvalidFileSize(_) => "invalid_file_size",
        }
    }
}

impl Classify for EventError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Kind of change reported by the object store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StorageEventType {
    Create,
    Update,
    Delete,
    Rename,
    /// Anything the store may emit that this version does not know about
    Other(String),
}

impl StorageEventType {
    /// Normalize a type string, accepting the aliases different emitters use
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" | "put" | "upload" => StorageEventType::Create,
            "update" | "modify" => StorageEventType::Update,
            "delete" | "remove" => StorageEventType::Delete,
            "rename" | "move" => StorageEventType::Rename,
            other => StorageEventType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StorageEventType::Create => "create",
            StorageEventType::Update => "update",
            StorageEventType::Delete => "delete",
            StorageEventType::Rename => "rename",
            StorageEventType::Other(other) => other,
        }
    }
}

impl From<String> for StorageEventType {
    fn from(value: String) -> Self {
        StorageEventType::parse(&value)
    }
}

impl From<StorageEventType> for String {
    fn from(value: StorageEventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StorageEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed view of an object key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePathInfo {
    pub tenant_id: Option<String>,
    pub bucket: Option<String>,
    pub category: Option<String>,
    pub file_path: Option<String>,
    pub is_directory: bool,
    pub is_tenant_path: bool,
}

impl StoragePathInfo {
    /// Parse `buckets/<tenant_id>/[<category>/][<file_path>]`.
    ///
    /// A leading `/` is ignored. Paths that do not follow the tenant layout
    /// come back with `is_tenant_path == false` and every other field empty.
    pub fn parse(path: &str) -> Self {
        let clean = path.trim_start_matches('/');

        let Some(rest) = clean
            .strip_prefix(TENANT_BUCKET)
            .and_then(|r| r.strip_prefix('/'))
        else {
            return Self::default();
        };

        // The tenant segment must be non-empty and followed by a slash
        let Some((tenant_id, remaining)) = rest.split_once('/') else {
            return Self::default();
        };
        if tenant_id.is_empty() {
            return Self::default();
        }

        let (category, file_path) = match remaining.split_once('/') {
            Some((category, file_path)) => (category, Some(file_path)),
            None => (remaining, None),
        };
        let file_path = file_path.filter(|f| !f.is_empty()).map(str::to_string);

        Self {
            tenant_id: Some(tenant_id.to_string()),
            bucket: Some(TENANT_BUCKET.to_string()),
            category: Some(category.to_string()).filter(|c| !c.is_empty()),
            is_directory: path.ends_with('/') || file_path.is_none(),
            file_path,
            is_tenant_path: true,
        }
    }

    /// Path inside the tenant directory, `<category>/<file_path>`
    pub fn relative_path(&self) -> String {
        match (&self.category, &self.file_path) {
            (Some(category), Some(file_path)) => format!("{}/{}", category, file_path),
            (Some(category), None) => category.clone(),
            _ => String::new(),
        }
    }
}

fn default_source() -> String {
    "unknown".to_string()
}

/// Object attributes carried by a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEventMetadata {
    pub file_size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for StorageEventMetadata {
    fn default() -> Self {
        Self {
            file_size: 0,
            content_type: None,
            last_modified: None,
            etag: None,
            source: default_source(),
        }
    }
}

/// A validated storage change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub event_type: StorageEventType,
    pub path: String,
    pub path_info: StoragePathInfo,
    pub tenant_id: String,
    pub relative_path: String,
    pub metadata: StorageEventMetadata,
    /// Unix seconds
    pub timestamp: f64,
}

/// Flat record understood by older consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyStorageEvent {
    pub tenant_id: String,
    pub file_path: String,
    pub operation: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub s3_key: String,
}

impl StorageEvent {
    /// Parse raw JSON bytes into an event
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;
        Self::from_raw_event(&raw)
    }

    /// Build an event from a heterogeneous raw notification
    pub fn from_raw_event(raw: &Value) -> Result<Self, EventError> {
        let object = raw.as_object().ok_or(EventError::NotAnObject)?;

        let event_type = first_str(object, &["event_type", "type", "operation"])
            .map(StorageEventType::parse)
            .ok_or(EventError::MissingEventType)?;

        let path = first_str(object, &["path", "key"])
            .or_else(|| {
                object
                    .get("entry")
                    .and_then(|entry| entry.get("FullPath"))
                    .and_then(Value::as_str)
            })
            .filter(|p| !p.is_empty())
            .ok_or(EventError::MissingPath)?
            .to_string();

        let path_info = StoragePathInfo::parse(&path);
        if !path_info.is_tenant_path {
            return Err(EventError::NonTenantPath(path));
        }
        if path_info.is_directory {
            return Err(EventError::DirectoryEvent(path));
        }

        let metadata = StorageEventMetadata {
            file_size: extract_file_size(object)?,
            content_type: first_str(object, &["content_type", "mime_type"]).map(str::to_string),
            last_modified: ["last_modified", "timestamp"]
                .iter()
                .find_map(|key| object.get(*key).and_then(value_to_string)),
            etag: first_str(object, &["etag"]).map(str::to_string),
            source: first_str(object, &["source"])
                .map(str::to_string)
                .unwrap_or_else(default_source),
        };

        let timestamp = object
            .get("timestamp")
            .and_then(value_to_f64)
            .unwrap_or_else(now_unix_secs);

        Ok(Self {
            event_type,
            tenant_id: path_info.tenant_id.clone().unwrap_or_default(),
            relative_path: path_info.relative_path(),
            path,
            path_info,
            metadata,
            timestamp,
        })
    }

    /// Why this event is kept out of the content pipeline, if it is
    pub fn rejection_reason(&self) -> Option<&'static str> {
        if self.path.contains(MULTIPART_UPLOAD_MARKER) {
            return Some("multipart_upload");
        }
        if !self.path_info.is_tenant_path {
            return Some("non_tenant_path");
        }
        if self.path_info.is_directory {
            return Some("directory_event");
        }
        if self.event_type == StorageEventType::Delete {
            return Some("delete_event");
        }
        None
    }

    /// Whether the event should be routed to a tier
    pub fn should_process(&self) -> bool {
        self.rejection_reason().is_none()
    }

    /// Project to the flat compatibility record
    pub fn to_legacy_format(&self) -> LegacyStorageEvent {
        LegacyStorageEvent {
            tenant_id: self.tenant_id.clone(),
            file_path: self.relative_path.clone(),
            operation: self.event_type.to_string(),
            size: self.metadata.file_size,
            mime_type: self.metadata.content_type.clone(),
            s3_key: self.path.clone(),
        }
    }
}

/// `should_process` over the raw notification; anything that fails to parse is rejected
pub fn should_process_raw(raw: &Value) -> bool {
    StorageEvent::from_raw_event(raw)
        .map(|event| event.should_process())
        .unwrap_or(false)
}

fn first_str<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn now_unix_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn parse_size(value: &Value) -> Result<Option<u64>, EventError> {
    let invalid = || EventError::InvalidFileSize(value.to_string());
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(size) = n.as_u64() {
                Ok(Some(size))
            } else if let Some(size) = n.as_f64() {
                if size >= 0.0 && size.is_finite() {
                    Ok(Some(size as u64))
                } else {
                    Err(invalid())
                }
            } else {
                Err(invalid())
            }
        }
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let size: i64 = s.trim().parse().map_err(|_| invalid())?;
            u64::try_from(size).map(Some).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// First non-zero size among `file_size`, `size` and `entry.attributes.file_size`
fn extract_file_size(object: &Map<String, Value>) -> Result<u64, EventError> {
    let nested = object
        .get("entry")
        .and_then(|entry| entry.get("attributes"))
        .and_then(|attributes| attributes.get("file_size"));

    let candidates = [object.get("file_size"), object.get("size"), nested];
    for candidate in candidates.into_iter().flatten() {
        match parse_size(candidate)? {
            Some(size) if size > 0 => return Ok(size),
            _ => continue,
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(path: &str) -> Value {
        json!({ "type": "create", "path": path, "file_size": 1 })
    }

    #[test]
    fn test_parse_tenant_path() {
        let info = StoragePathInfo::parse("buckets/tenant-1/docs/reports/a.txt");
        assert!(info.is_tenant_path);
        assert!(!info.is_directory);
        assert_eq!(info.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(info.bucket.as_deref(), Some("buckets"));
        assert_eq!(info.category.as_deref(), Some("docs"));
        assert_eq!(info.file_path.as_deref(), Some("reports/a.txt"));
        assert_eq!(info.relative_path(), "docs/reports/a.txt");
    }

    #[test]
    fn test_parse_leading_slash() {
        let info = StoragePathInfo::parse("/buckets/t/docs/a.txt");
        assert!(info.is_tenant_path);
        assert_eq!(info.tenant_id.as_deref(), Some("t"));
    }

    #[test]
    fn test_parse_non_tenant_path() {
        for path in ["other/tenant/docs/a.txt", "buckets/tenant", "buckets//docs/a.txt", "a.txt"] {
            let info = StoragePathInfo::parse(path);
            assert_eq!(info, StoragePathInfo::default(), "{}", path);
        }
    }

    #[test]
    fn test_parse_directories() {
        assert!(StoragePathInfo::parse("buckets/t/docs/").is_directory);
        assert!(StoragePathInfo::parse("buckets/t/docs/sub/").is_directory);
        assert!(StoragePathInfo::parse("buckets/t/docs").is_directory);
        assert!(StoragePathInfo::parse("buckets/t/").is_directory);
    }

    #[test]
    fn test_from_raw_event_basic() {
        let event = StorageEvent::from_raw_event(&json!({
            "type": "create",
            "path": "buckets/tenant-1/docs/a.txt",
            "file_size": 1,
            "content_type": "text/plain",
            "timestamp": 1700000000.5
        }))
        .unwrap();

        assert_eq!(event.event_type, StorageEventType::Create);
        assert_eq!(event.tenant_id, "tenant-1");
        assert_eq!(event.relative_path, "docs/a.txt");
        assert_eq!(event.metadata.file_size, 1);
        assert_eq!(event.metadata.content_type.as_deref(), Some("text/plain"));
        assert_eq!(event.metadata.source, "unknown");
        assert_eq!(event.timestamp, 1700000000.5);
    }

    #[test]
    fn test_from_raw_event_aliases() {
        let event = StorageEvent::from_raw_event(&json!({
            "operation": "PUT",
            "key": "buckets/t/images/cat.png",
            "size": "2048",
            "mime_type": "image/png",
            "source": "seaweedfs"
        }))
        .unwrap();
        assert_eq!(event.event_type, StorageEventType::Create);
        assert_eq!(event.path, "buckets/t/images/cat.png");
        assert_eq!(event.metadata.file_size, 2048);
        assert_eq!(event.metadata.content_type.as_deref(), Some("image/png"));
        assert_eq!(event.metadata.source, "seaweedfs");
    }

    #[test]
    fn test_from_raw_event_nested_entry() {
        let event = StorageEvent::from_raw_event(&json!({
            "event_type": "modify",
            "entry": { "FullPath": "/buckets/t/docs/a.md", "attributes": { "file_size": 77 } }
        }))
        .unwrap();
        assert_eq!(event.event_type, StorageEventType::Update);
        assert_eq!(event.metadata.file_size, 77);
    }

    #[test]
    fn test_unknown_event_type_is_kept() {
        let event = StorageEvent::from_raw_event(&json!({
            "type": "chmod",
            "path": "buckets/t/docs/a.txt"
        }))
        .unwrap();
        assert_eq!(event.event_type, StorageEventType::Other("chmod".to_string()));
        assert!(event.should_process());
    }

    #[test]
    fn test_from_raw_event_errors() {
        assert_eq!(
            StorageEvent::from_raw_event(&json!({ "type": "create" })),
            Err(EventError::MissingPath)
        );
        assert_eq!(
            StorageEvent::from_raw_event(&json!({ "path": "buckets/t/docs/a.txt" })),
            Err(EventError::MissingEventType)
        );
        assert_eq!(
            StorageEvent::from_raw_event(&json!([1, 2])),
            Err(EventError::NotAnObject)
        );
        assert!(matches!(
            StorageEvent::from_raw_event(&raw("tmp/t/docs/a.txt")),
            Err(EventError::NonTenantPath(_))
        ));
        assert!(matches!(
            StorageEvent::from_raw_event(&raw("buckets/t/docs/")),
            Err(EventError::DirectoryEvent(_))
        ));
        assert!(matches!(
            StorageEvent::from_raw_event(&json!({
                "type": "create", "path": "buckets/t/docs/a.txt", "file_size": -5
            })),
            Err(EventError::InvalidFileSize(_))
        ));
        assert!(matches!(
            StorageEvent::from_slice(b"not json"),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_errors_are_validation_class() {
        assert_eq!(EventError::MissingPath.class(), ErrorClass::Validation);
        assert!(!EventError::MissingPath.class().is_retryable());
    }

    #[test]
    fn test_should_process() {
        let create = StorageEvent::from_raw_event(&raw("buckets/t/docs/a.txt")).unwrap();
        assert!(create.should_process());

        let multipart =
            StorageEvent::from_raw_event(&raw("buckets/t/docs/a.txt?uploadId=abc")).unwrap();
        assert_eq!(multipart.rejection_reason(), Some("multipart_upload"));
        assert!(!multipart.should_process());

        let delete = StorageEvent::from_raw_event(&json!({
            "type": "remove", "path": "buckets/t/docs/a.txt"
        }))
        .unwrap();
        assert_eq!(delete.event_type, StorageEventType::Delete);
        assert!(!delete.should_process());

        assert!(!should_process_raw(&raw("elsewhere/a.txt")));
        assert!(!should_process_raw(&json!("garbage")));
        assert!(should_process_raw(&raw("buckets/t/docs/a.txt")));
    }

    #[test]
    fn test_legacy_format() {
        let event = StorageEvent::from_raw_event(&json!({
            "type": "update",
            "path": "buckets/tenant-9/docs/a.txt",
            "file_size": 42,
            "content_type": "text/plain"
        }))
        .unwrap();
        let legacy = event.to_legacy_format();
        assert_eq!(legacy.tenant_id, "tenant-9");
        assert_eq!(legacy.file_path, "docs/a.txt");
        assert_eq!(legacy.operation, "update");
        assert_eq!(legacy.size, 42);
        assert_eq!(legacy.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(legacy.s3_key, "buckets/tenant-9/docs/a.txt");
    }

    #[test]
    fn test_event_type_serde() {
        let json = serde_json::to_string(&StorageEventType::Rename).unwrap();
        assert_eq!(json, "\"rename\"");
        let parsed: StorageEventType = serde_json::from_str("\"move\"").unwrap();
        assert_eq!(parsed, StorageEventType::Rename);
    }
}
