use std::fmt;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum that is persisted as a snake_case `TEXT` column.
macro_rules! string_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            serde::Deserialize,
            diesel::AsExpression,
            diesel::FromSqlRow,
        )]
        #[serde(rename_all = "snake_case")]
        #[diesel(sql_type = diesel::sql_types::Text)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::models::UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err($crate::models::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl diesel::serialize::ToSql<diesel::sql_types::Text, diesel::pg::Pg> for $name {
            fn to_sql<'b>(
                &'b self,
                out: &mut diesel::serialize::Output<'b, '_, diesel::pg::Pg>,
            ) -> diesel::serialize::Result {
                use std::io::Write;
                out.write_all(self.as_str().as_bytes())?;
                Ok(diesel::serialize::IsNull::No)
            }
        }

        impl diesel::deserialize::FromSql<diesel::sql_types::Text, diesel::pg::Pg> for $name {
            fn from_sql(bytes: diesel::pg::PgValue<'_>) -> diesel::deserialize::Result<Self> {
                let raw = <String as diesel::deserialize::FromSql<
                    diesel::sql_types::Text,
                    diesel::pg::Pg,
                >>::from_sql(bytes)?;
                Ok(raw.parse::<$name>()?)
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// Where an organization keeps the bytes of its files.
    pub enum StoragePolicy {
        Local => "local",
        ObjectStore => "object_store",
        Hybrid => "hybrid",
    }
}

string_enum! {
    pub enum StorageBackendKind {
        ObjectStore => "object_store",
        Local => "local",
    }
}

impl StorageBackendKind {
    pub fn other(self) -> Self {
        match self {
            StorageBackendKind::ObjectStore => StorageBackendKind::Local,
            StorageBackendKind::Local => StorageBackendKind::ObjectStore,
        }
    }
}

string_enum! {
    pub enum Visibility {
        Private => "private",
        Organization => "organization",
        Public => "public",
    }
}

string_enum! {
    /// Coarse logical type derived from the mime type at upload.
    pub enum FileType {
        Pdf => "pdf",
        Image => "image",
        Document => "document",
        Spreadsheet => "spreadsheet",
        Text => "text",
        Other => "other",
    }
}

string_enum! {
    pub enum ExtractionMethod {
        DirectText => "direct_text",
        OfficeDocument => "office_document",
        Spreadsheet => "spreadsheet",
        FastPdf => "fast_pdf",
        SyncOcr => "sync_ocr",
        AsyncOcr => "async_ocr",
    }
}

impl ExtractionMethod {
    /// Duration estimate used when a job carries no classification metadata.
    pub fn baseline_duration_ms(self) -> u64 {
        match self {
            ExtractionMethod::DirectText => 1_000,
            ExtractionMethod::OfficeDocument => 2_000,
            ExtractionMethod::Spreadsheet => 3_000,
            ExtractionMethod::FastPdf => 3_000,
            ExtractionMethod::SyncOcr => 15_000,
            ExtractionMethod::AsyncOcr => 30_000,
        }
    }

    pub fn is_ocr(self) -> bool {
        matches!(self, ExtractionMethod::SyncOcr | ExtractionMethod::AsyncOcr)
    }
}

string_enum! {
    pub enum JobStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    pub enum IndexStatus {
        NotIndexed => "not_indexed",
        Indexing => "indexing",
        Indexed => "indexed",
        IndexFailed => "index_failed",
    }
}

string_enum! {
    pub enum SyncType {
        Full => "full",
        Incremental => "incremental",
        File => "file",
    }
}

/// Sync types that cover a whole organization.
pub const ORGANIZATION_SYNC_TYPES: [SyncType; 2] = [SyncType::Full, SyncType::Incremental];

string_enum! {
    pub enum SyncStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    pub enum QueueEntryStatus {
        Queued => "queued",
        Processing => "processing",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset,
)]
#[diesel(table_name = organization_settings, primary_key(organization_id), treat_none_as_null = true)]
pub struct OrganizationSettings {
    pub organization_id: Uuid,
    pub storage_policy: StoragePolicy,
    pub primary_backend: StorageBackendKind,
    pub quota_bytes: Option<i64>,
    pub downstream_enabled: bool,
}

impl OrganizationSettings {
    pub fn primary(&self) -> StorageBackendKind {
        match self.storage_policy {
            StoragePolicy::Local => StorageBackendKind::Local,
            StoragePolicy::ObjectStore => StorageBackendKind::ObjectStore,
            StoragePolicy::Hybrid => self.primary_backend,
        }
    }

    pub fn backup(&self) -> Option<StorageBackendKind> {
        match self.storage_policy {
            StoragePolicy::Hybrid => Some(self.primary_backend.other()),
            _ => None,
        }
    }

    pub fn required_backends(&self) -> Vec<StorageBackendKind> {
        let mut backends = vec![self.primary()];
        backends.extend(self.backup());
        backends
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = files)]
pub struct FileRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub original_name: String,
    pub title: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub file_type: FileType,
    pub checksum: String,
    pub department: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub metadata: Value,
    pub is_active: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Files that are live and may appear in search results.
    pub fn is_searchable(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = storage_locations)]
pub struct StorageLocation {
    pub id: Uuid,
    pub file_id: Uuid,
    pub backend: StorageBackendKind,
    pub locator: String,
    pub is_primary: bool,
    pub storage_class: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset,
)]
#[diesel(table_name = extraction_jobs, treat_none_as_null = true)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub method: ExtractionMethod,
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub metadata: Value,
}

pub const FULL_TEXT_CONTENT: &str = "full_text";

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset,
)]
#[diesel(
    table_name = extracted_text_contents,
    primary_key(file_id, content_type),
    treat_none_as_null = true
)]
pub struct ExtractedTextContent {
    pub file_id: Uuid,
    pub content_type: String,
    pub extraction_job_id: Option<Uuid>,
    pub text: String,
    pub word_count: i32,
    pub character_count: i32,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset,
)]
#[diesel(table_name = search_index_statuses, primary_key(file_id), treat_none_as_null = true)]
pub struct SearchIndexStatus {
    pub file_id: Uuid,
    pub status: IndexStatus,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SearchIndexStatus {
    pub fn new(file_id: Uuid) -> Self {
        Self {
            file_id,
            status: IndexStatus::NotIndexed,
            last_indexed_at: None,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset,
)]
#[diesel(table_name = storage_sync_jobs, treat_none_as_null = true)]
pub struct StorageSyncJob {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub triggered_by: String,
    pub file_id: Option<Uuid>,
    pub files_checked: i32,
    pub files_repaired: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the durable work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = queue_entries)]
pub struct QueueEntry {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    pub priority: i32,
    pub sequence: i64,
    pub status: QueueEntryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub queue: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
    pub dedupe_key: Option<String>,
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.queue, self.id)
    }
}
