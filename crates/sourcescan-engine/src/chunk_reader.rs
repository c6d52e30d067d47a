//! Chunk Reader: turns an arbitrary byte stream into overlapping,
//! fixed-size chunks (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use sourcescan_core::ScanError;

use crate::cancel::CancelToken;

static ACTIVE_READERS: AtomicUsize = AtomicUsize::new(0);

/// Number of chunk-reading tasks currently live. Used by the cancellation
/// property test to assert the pool drains back to baseline.
pub fn active_reader_count() -> usize {
    ACTIVE_READERS.load(Ordering::SeqCst)
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        ACTIVE_READERS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_READERS.fetch_sub(1, Ordering::SeqCst);
    }
}

type BufferPool = Mutex<HashMap<usize, Vec<Vec<u8>>>>;

fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

const POOL_CAP_PER_SIZE: usize = 32;

fn acquire_buffer(size: usize) -> Vec<u8> {
    let mut pool = pool().lock().expect("chunk reader pool poisoned");
    match pool.get_mut(&size).and_then(|bucket| bucket.pop()) {
        Some(mut buf) => {
            buf.clear();
            buf.resize(size, 0);
            buf
        }
        None => vec![0u8; size],
    }
}

fn release_buffer(size: usize, buf: Vec<u8>) {
    let mut pool = pool().lock().expect("chunk reader pool poisoned");
    let bucket = pool.entry(size).or_default();
    if bucket.len() < POOL_CAP_PER_SIZE {
        bucket.push(buf);
    }
}

/// Configuration for a single chunking pass over a reader.
#[derive(Debug, Clone, Copy)]
pub struct ChunkReader {
    pub chunk_size: usize,
    pub peek_size: usize,
}

impl ChunkReader {
    pub fn new(chunk_size: usize, peek_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self { chunk_size, peek_size }
    }

    /// Spawns a task reading `reader` and returns a channel of chunk
    /// results. The channel carries at most one error, always last: either
    /// a cancellation or a captured panic from the underlying reader.
    pub fn read(
        &self,
        reader: impl AsyncRead + Unpin + Send + 'static,
        cancel: CancelToken,
    ) -> mpsc::Receiver<Result<Vec<u8>, ScanError>> {
        let (tx, rx) = mpsc::channel(8);
        let supervisor_tx = tx.clone();
        let chunk_size = self.chunk_size;
        let peek_size = self.peek_size;

        tokio::spawn(async move {
            let handle = tokio::spawn(read_loop(reader, chunk_size, peek_size, cancel, tx));
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    let _ = supervisor_tx
                        .send(Err(ScanError::fatal(format!("chunk reader panicked: {join_err}"))))
                        .await;
                }
            }
        });

        rx
    }
}

async fn read_loop(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    chunk_size: usize,
    peek_size: usize,
    cancel: CancelToken,
    tx: mpsc::Sender<Result<Vec<u8>, ScanError>>,
) {
    let _guard = ActiveGuard::enter();
    let target = chunk_size + peek_size;
    let mut window: VecDeque<u8> = VecDeque::with_capacity(target);
    let mut scratch = acquire_buffer(target);
    let mut eof = false;

    loop {
        if cancel.is_cancelled() {
            let _ = tx.send(Err(ScanError::cancelled("chunk reader cancelled"))).await;
            break;
        }

        while !eof && window.len() < target {
            let read_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(ScanError::cancelled("chunk reader cancelled"))).await;
                    release_buffer(target, scratch);
                    return;
                }
                result = reader.read(&mut scratch) => result,
            };
            match read_result {
                Ok(0) => eof = true,
                Ok(n) => window.extend(scratch[..n].iter().copied()),
                Err(err) => {
                    let _ = tx.send(Err(ScanError::fatal(format!("chunk reader io error: {err}")))).await;
                    release_buffer(target, scratch);
                    return;
                }
            }
        }

        if window.is_empty() {
            break;
        }

        let body_len = chunk_size.min(window.len());
        let lookahead_len = peek_size.min(window.len() - body_len);
        let payload: Vec<u8> = window.iter().take(body_len + lookahead_len).copied().collect();
        for _ in 0..body_len {
            window.pop_front();
        }

        if tx.send(Ok(payload)).await.is_err() {
            break;
        }

        if eof && window.is_empty() {
            break;
        }
    }

    release_buffer(target, scratch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn collect_bodies(chunks: &[Vec<u8>], chunk_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i + 1 == chunks.len() {
                out.extend_from_slice(chunk);
            } else {
                out.extend_from_slice(&chunk[..chunk_size.min(chunk.len())]);
            }
        }
        out
    }

    #[tokio::test]
    async fn reconstructs_exact_input_with_overlap() {
        let input = b"ABCDEFGHIJ".to_vec();
        let reader = ChunkReader::new(4, 2);
        let mut rx = reader.read(std::io::Cursor::new(input.clone()), CancelToken::new());

        let mut chunks = Vec::new();
        while let Some(result) = rx.recv().await {
            chunks.push(result.expect("no io error"));
        }

        assert_eq!(chunks, vec![b"ABCDEF".to_vec(), b"EFGHIJ".to_vec(), b"IJ".to_vec()]);
        assert_eq!(collect_bodies(&chunks, 4), input);
    }

    #[tokio::test]
    async fn short_input_emits_single_chunk_with_no_lookahead() {
        let input = b"hi".to_vec();
        let reader = ChunkReader::new(4, 2);
        let mut rx = reader.read(std::io::Cursor::new(input.clone()), CancelToken::new());
        let chunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(chunk, input);
        assert!(rx.recv().await.is_none());
    }

    struct Forever;

    impl AsyncRead for Forever {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let zeros = [0u8; 64];
            let n = zeros.len().min(buf.remaining());
            buf.put_slice(&zeros[..n]);
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn cancellation_drains_active_readers_within_budget() {
        let cancel = CancelToken::new();
        let reader = ChunkReader::new(16, 4);
        let mut rx = reader.read(Forever, cancel.clone());
        let _ = rx.recv().await;

        cancel.cancel();
        let start = Instant::now();
        while active_reader_count() > 0 && start.elapsed() < Duration::from_millis(100) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(active_reader_count(), 0);
    }

    struct PanicReader;

    impl AsyncRead for PanicReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            panic!("reader exploded");
        }
    }

    #[tokio::test]
    async fn underlying_panic_surfaces_as_fatal_error() {
        let reader = ChunkReader::new(4, 1);
        let mut rx = reader.read(PanicReader, CancelToken::new());
        let result = rx.recv().await.expect("one result");
        let err = result.expect_err("panic must surface as an error");
        assert!(err.is_fatal());
    }
}
