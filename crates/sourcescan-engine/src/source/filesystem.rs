//! A unit-aware source: one unit per regular file under a root directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;

use sourcescan_core::{Chunk, ScanError, SourceMetadata, SourceUnit};

use crate::cancel::CancelToken;
use crate::chunk_reader::ChunkReader;

use super::{ChunkReporter, SourceInit, SourceMeta, UnitAwareSource, UnitReporter};

pub struct FilesystemSource {
    root: PathBuf,
    chunk_size: usize,
    peek_size: usize,
    init: Option<SourceInit>,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: 8192,
            peek_size: 64,
            init: None,
        }
    }
}

#[async_trait]
impl SourceMeta for FilesystemSource {
    fn type_tag(&self) -> &str {
        "filesystem"
    }

    async fn init(&mut self, init: &SourceInit) -> Result<(), ScanError> {
        self.init = Some(init.clone());
        Ok(())
    }
}

#[async_trait]
impl UnitAwareSource for FilesystemSource {
    async fn enumerate(&mut self, cancel: CancelToken, reporter: UnitReporter) -> Result<(), ScanError> {
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(ScanError::cancelled("filesystem enumeration cancelled"));
            }
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| ScanError::fatal(format!("read_dir {}: {e}", dir.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ScanError::fatal(format!("read_dir entry in {}: {e}", dir.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ScanError::fatal(format!("stat {}: {e}", path.display())))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_string_lossy().into_owned();
                reporter.ok(SourceUnit::new(relative, "file")).await?;
            }
        }
        Ok(())
    }

    async fn chunk_unit(&mut self, cancel: CancelToken, unit: SourceUnit, reporter: ChunkReporter) -> Result<(), ScanError> {
        let init = self.init.clone().ok_or_else(|| ScanError::fatal("filesystem source used before init"))?;
        let path = self.root.join(&unit.id);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ScanError::chunk(unit.clone(), format!("open {}: {e}", path.display())))?;
        let reader = BufReader::new(file);
        let chunk_reader = ChunkReader::new(self.chunk_size, self.peek_size);
        let mut rx = chunk_reader.read(reader, cancel);

        while let Some(result) = rx.recv().await {
            match result {
                Ok(payload) => {
                    let chunk = Chunk {
                        source_id: init.source_id,
                        source_name: Arc::from(init.name.as_str()),
                        job_id: init.job_id,
                        source_type: Arc::from(self.type_tag()),
                        metadata: SourceMetadata::Filesystem { path: unit.id.clone() },
                        payload: Arc::from(payload.into_boxed_slice()),
                        verify: init.verify,
                    };
                    reporter.ok(chunk).await?;
                }
                Err(err) => {
                    reporter.err(err.to_string());
                    break;
                }
            }
        }
        Ok(())
    }
}
