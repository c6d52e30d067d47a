//! A monolithic source: a stream of newline-delimited JSON bundle records.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use sourcescan_core::json_bundle::parse_line;
use sourcescan_core::{Chunk, ScanError, SourceMetadata};

use crate::cancel::CancelToken;

use super::{ChunkReporter, MonolithicSource, SourceInit, SourceMeta};

pub struct JsonBundleSource<R> {
    reader: Option<R>,
    init: Option<SourceInit>,
}

impl<R> JsonBundleSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader: Some(reader), init: None }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync + 'static> SourceMeta for JsonBundleSource<R> {
    fn type_tag(&self) -> &str {
        "json-bundle"
    }

    async fn init(&mut self, init: &SourceInit) -> Result<(), ScanError> {
        self.init = Some(init.clone());
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync + 'static> MonolithicSource for JsonBundleSource<R> {
    async fn chunks(&mut self, cancel: CancelToken, sink: ChunkReporter) -> Result<(), ScanError> {
        let init = self.init.clone().ok_or_else(|| ScanError::fatal("json bundle source used before init"))?;
        let reader = self.reader.take().ok_or_else(|| ScanError::fatal("json bundle source driven twice"))?;
        let mut lines = BufReader::new(reader).lines();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::cancelled("json bundle chunking cancelled")),
                line = lines.next_line() => line,
            };
            let Some(line) = next.map_err(|e| ScanError::fatal(format!("json bundle read error: {e}")))? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(record) => {
                    let chunk = Chunk {
                        source_id: init.source_id,
                        source_name: Arc::from(init.name.as_str()),
                        job_id: init.job_id,
                        source_type: Arc::from("json-bundle"),
                        metadata: SourceMetadata::JsonBundle { metadata_json: record.metadata },
                        payload: Arc::from(record.data.into_boxed_slice()),
                        verify: init.verify,
                    };
                    sink.ok(chunk).await?;
                }
                Err(err) => sink.err(err.to_string()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use sourcescan_core::{JobId, SourceHandle};
    use tokio::sync::mpsc;

    use crate::progress::JobProgress;

    #[tokio::test]
    async fn monolithic_source_emits_one_chunk_per_record() {
        let input = b"{\"metadata\":{\"n\":1},\"data\":\"a\"}\n{\"metadata\":{\"n\":2},\"data\":\"b\"}\n".to_vec();
        let mut source = JsonBundleSource::new(std::io::Cursor::new(input));
        let init = SourceInit {
            name: "bundle".into(),
            job_id: JobId(1),
            source_id: SourceHandle(1),
            verify: false,
            concurrency: 1,
        };
        source.init(&init).await.unwrap();

        let progress = JobProgress::new(SourceHandle(1), JobId(1), Vec::new(), CancelToken::new());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = progress.cancel_token().clone();
        let reporter = ChunkReporter::new(tx, None, StdArc::clone(&progress), cancel.clone());

        source.chunks(cancel, reporter).await.unwrap();

        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert_eq!(&*chunks[0].payload, b"a");
    }
}
