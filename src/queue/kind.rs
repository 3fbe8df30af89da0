use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QueueName;
use crate::models::{string_enum, ExtractionMethod};

string_enum! {
    /// Work handed to the downstream AI layer once text is available.
    pub enum DownstreamTask {
        Summary => "summary",
        Tags => "tags",
    }
}

/// Every unit of background work, serialized as the queue entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Extraction {
        extraction_job_id: Uuid,
        file_id: Uuid,
        method: ExtractionMethod,
        priority: i32,
    },
    IndexFile {
        file_id: Uuid,
    },
    RemoveFromIndex {
        file_id: Uuid,
    },
    BulkIndex {
        organization_id: Uuid,
        batch_size: i64,
        #[serde(default)]
        reindex: bool,
    },
    StorageSync {
        sync_job_id: Uuid,
    },
    Downstream {
        file_id: Uuid,
        task: DownstreamTask,
    },
}

impl JobKind {
    pub fn queue(&self) -> QueueName {
        match self {
            JobKind::Extraction { .. } => QueueName::Extraction,
            JobKind::IndexFile { .. } | JobKind::RemoveFromIndex { .. } | JobKind::BulkIndex { .. } => {
                QueueName::Indexing
            }
            JobKind::StorageSync { .. } => QueueName::Storage,
            JobKind::Downstream { .. } => QueueName::Downstream,
        }
    }

    /// Priority used when the caller has no better opinion.
    pub fn default_priority(&self) -> i32 {
        match self {
            JobKind::Extraction { priority, .. } => *priority,
            JobKind::RemoveFromIndex { .. } => 6,
            JobKind::IndexFile { .. } => 5,
            JobKind::StorageSync { .. } => 3,
            JobKind::BulkIndex { .. } | JobKind::Downstream { .. } => 2,
        }
    }

    /// A queued entry with the same key makes a second enqueue a no-op.
    pub fn dedupe_key(&self) -> String {
        match self {
            JobKind::Extraction {
                extraction_job_id, ..
            } => format!("extraction:{extraction_job_id}"),
            JobKind::IndexFile { file_id } => format!("index:{file_id}"),
            JobKind::RemoveFromIndex { file_id } => format!("unindex:{file_id}"),
            JobKind::BulkIndex {
                organization_id, ..
            } => format!("bulk-index:{organization_id}"),
            JobKind::StorageSync { sync_job_id } => format!("sync:{sync_job_id}"),
            JobKind::Downstream { file_id, task } => format!("downstream:{task}:{file_id}"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Extraction { .. } => "extraction",
            JobKind::IndexFile { .. } => "index_file",
            JobKind::RemoveFromIndex { .. } => "remove_from_index",
            JobKind::BulkIndex { .. } => "bulk_index",
            JobKind::StorageSync { .. } => "storage_sync",
            JobKind::Downstream { .. } => "downstream",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payloads_are_tagged_by_kind() {
        let file_id = Uuid::nil();
        let encoded = serde_json::to_value(JobKind::IndexFile { file_id }).unwrap();
        assert_eq!(encoded, json!({ "kind": "index_file", "file_id": file_id }));

        let decoded: JobKind = serde_json::from_value(json!({
            "kind": "bulk_index",
            "organization_id": file_id,
            "batch_size": 50,
        }))
        .unwrap();
        assert_eq!(
            decoded,
            JobKind::BulkIndex {
                organization_id: file_id,
                batch_size: 50,
                reindex: false
            }
        );
    }

    #[test]
    fn kinds_route_to_their_queue() {
        let id = Uuid::new_v4();
        assert_eq!(
            JobKind::RemoveFromIndex { file_id: id }.queue(),
            QueueName::Indexing
        );
        assert_eq!(
            JobKind::StorageSync { sync_job_id: id }.queue(),
            QueueName::Storage
        );
        assert_eq!(
            JobKind::Downstream {
                file_id: id,
                task: DownstreamTask::Tags
            }
            .dedupe_key(),
            format!("downstream:tags:{id}")
        );
    }
}
