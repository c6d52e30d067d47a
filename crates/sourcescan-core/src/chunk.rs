use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::unit::{JobId, SourceHandle};

/// Wire-stable tagged provenance payload (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceMetadata {
    Git {
        repo: String,
        commit: String,
        path: String,
        line: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
    Github {
        repo: String,
        commit: String,
        path: String,
        line: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
    Gitlab {
        project_id: String,
        repo: String,
        commit: String,
        path: String,
        line: u64,
    },
    S3 {
        bucket: String,
        key: String,
    },
    Filesystem {
        path: String,
    },
    ElasticsearchLike {
        index: String,
        document_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    JsonBundle {
        metadata_json: serde_json::Value,
    },
}

/// The unit of byte-level output. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub source_id: SourceHandle,
    pub source_name: Arc<str>,
    pub job_id: JobId,
    pub source_type: Arc<str>,
    pub metadata: SourceMetadata,
    pub payload: Arc<[u8]>,
    pub verify: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
