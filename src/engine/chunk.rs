use super::counter::{Counter, REPEAT_SIZE};
use super::Error;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Scratch buffer size for streamed downloads.
const SCRATCH_SIZE: usize = 8192;

/// Shared pool of discard buffers so concurrent downloads do not allocate
/// per request.
static BLACK_HOLE: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn scratch() -> Vec<u8> {
    BLACK_HOLE
        .lock()
        .unwrap()
        .pop()
        .unwrap_or_else(|| vec![0u8; SCRATCH_SIZE])
}

fn recycle(buf: Vec<u8>) {
    let mut pool = BLACK_HOLE.lock().unwrap();
    if pool.len() < 64 {
        pool.push(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    DownloadHttp,
    UploadHttp,
    DownloadTcp,
    UploadTcp,
}

impl ChunkKind {
    pub fn is_download(self) -> bool {
        matches!(self, ChunkKind::DownloadHttp | ChunkKind::DownloadTcp)
    }
}

/// Completed-chunk record appended to the owning direction's trace.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub kind: Option<ChunkKind>,
    pub bytes: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

struct ChunkState {
    counter: Arc<Counter>,
    kind: OnceLock<ChunkKind>,
    start: Mutex<Option<Instant>>,
    end: Mutex<Option<Instant>>,
    content_length: Mutex<u64>,
    // Bytes discarded so far (download) or bytes still to emit (upload).
    remain_or_discard: Mutex<u64>,
    error: Mutex<Option<String>>,
}

impl ChunkState {
    fn begin(&self, kind: ChunkKind) -> Result<(), Error> {
        if self.kind.set(kind).is_err() {
            *self.error.lock().unwrap() = Some(Error::DuplicateCall.to_string());
            return Err(Error::DuplicateCall);
        }
        *self.start.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    fn finish(&self) {
        let mut end = self.end.lock().unwrap();
        if end.is_none() {
            *end = Some(Instant::now());
        }
    }

    fn record_error(&self, err: &Error) {
        *self.error.lock().unwrap() = Some(err.to_string());
    }
}

/// One request's worth of I/O. All bytes that flow through a chunk are
/// reported to the owning [`Counter`]; the chunk itself only keeps enough
/// state to answer rate/duration questions afterwards.
pub struct Chunk {
    inner: Arc<ChunkState>,
}

impl Chunk {
    pub fn new(counter: Arc<Counter>) -> Self {
        Self {
            inner: Arc::new(ChunkState {
                counter,
                kind: OnceLock::new(),
                start: Mutex::new(None),
                end: Mutex::new(None),
                content_length: Mutex::new(0),
                remain_or_discard: Mutex::new(0),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> Option<ChunkKind> {
        self.inner.kind.get().copied()
    }

    pub fn len(&self) -> u64 {
        *self.inner.content_length.lock().unwrap()
    }

    pub fn duration(&self) -> Duration {
        let start = self.inner.start.lock().unwrap();
        let end = self.inner.end.lock().unwrap();
        match (*start, *end) {
            (Some(s), Some(e)) => e.duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Average byte rate of this chunk, bytes per second.
    pub fn rate(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred() as f64 / secs
    }

    fn transferred(&self) -> u64 {
        let moved = *self.inner.remain_or_discard.lock().unwrap();
        match self.kind() {
            Some(k) if k.is_download() => moved,
            Some(_) => self.len() - moved,
            None => 0,
        }
    }

    pub fn report(&self) -> ChunkReport {
        ChunkReport {
            kind: self.kind(),
            bytes: self.transferred(),
            duration: self.duration(),
            error: self.inner.error.lock().unwrap().clone(),
        }
    }

    /// Drain an HTTP response body into the counter. Errors terminate the
    /// chunk but are not fatal for the direction; the remote closing the
    /// connection mid-body is the common case.
    pub async fn download_http(&self, resp: reqwest::Response) -> Result<(), Error> {
        self.inner.begin(ChunkKind::DownloadHttp)?;
        let mut body = resp.bytes_stream();
        let result = loop {
            tokio::select! {
                _ = self.inner.counter.cancelled() => break Ok(()),
                next = body.next() => match next {
                    None => break Ok(()),
                    Some(Ok(buf)) => {
                        let n = buf.len() as u64;
                        *self.inner.remain_or_discard.lock().unwrap() += n;
                        self.inner.counter.add(n);
                    }
                    Some(Err(e)) => {
                        let err = Error::from(e);
                        self.inner.record_error(&err);
                        break Err(err);
                    }
                },
            }
        };
        self.inner.finish();
        result
    }

    /// Drain a raw TCP stream into the counter using a pooled scratch buffer.
    pub async fn download_tcp<R>(&self, mut reader: R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        self.inner.begin(ChunkKind::DownloadTcp)?;
        let mut buf = scratch();
        let result = loop {
            tokio::select! {
                _ = self.inner.counter.cancelled() => break Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        *self.inner.remain_or_discard.lock().unwrap() += n as u64;
                        self.inner.counter.add(n as u64);
                    }
                    Err(e) => {
                        let err = Error::from(e);
                        self.inner.record_error(&err);
                        break Err(err);
                    }
                },
            }
        };
        recycle(buf);
        self.inner.finish();
        result
    }

    /// Turn this chunk into the byte source of an outbound HTTP body.
    ///
    /// The stream emits `size` bytes drawn from the direction's repeat
    /// pattern, crediting the counter as each piece is produced, so the
    /// counted volume and the on-wire volume advance together even when the
    /// transport buffers underneath. The stream is one-shot: it cannot be
    /// restarted, which also rules out transport-level retries.
    pub fn upload_handler(
        &self,
        size: u64,
    ) -> Result<impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static, Error> {
        self.inner.begin(ChunkKind::UploadHttp)?;
        *self.inner.content_length.lock().unwrap() = size;
        *self.inner.remain_or_discard.lock().unwrap() = size;

        let inner = self.inner.clone();
        let pattern = inner.counter.repeat();
        Ok(futures::stream::unfold(
            (inner, pattern),
            |(inner, pattern)| async move {
                if inner.counter.is_cancelled() {
                    inner.finish();
                    return None;
                }
                let remain = *inner.remain_or_discard.lock().unwrap();
                if remain == 0 {
                    inner.finish();
                    return None;
                }
                let n = remain.min(REPEAT_SIZE as u64);
                let piece = pattern.slice(..n as usize);
                *inner.remain_or_discard.lock().unwrap() -= n;
                inner.counter.add(n);
                Some((Ok(piece), (inner, pattern)))
            },
        ))
    }

    /// Emit `size` bytes of the repeat pattern to a raw TCP stream.
    pub async fn write_to<W>(&self, mut writer: W, size: u64) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin,
    {
        self.inner.begin(ChunkKind::UploadTcp)?;
        *self.inner.content_length.lock().unwrap() = size;
        *self.inner.remain_or_discard.lock().unwrap() = size;

        let pattern = self.inner.counter.repeat();
        let mut written = 0u64;
        let result = loop {
            if self.inner.counter.is_cancelled() {
                break Ok(written);
            }
            let remain = *self.inner.remain_or_discard.lock().unwrap();
            if remain == 0 {
                break Ok(written);
            }
            let n = remain.min(REPEAT_SIZE as u64) as usize;
            match writer.write(&pattern[..n]).await {
                Ok(nw) => {
                    written += nw as u64;
                    *self.inner.remain_or_discard.lock().unwrap() -= nw as u64;
                    self.inner.counter.add(nw as u64);
                    if nw != n {
                        let err = Error::ShortWrite;
                        self.inner.record_error(&err);
                        break Err(err);
                    }
                }
                Err(e) => {
                    let err = Error::from(e);
                    self.inner.record_error(&err);
                    break Err(err);
                }
            }
        };
        self.inner.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn upload_emission_accounting() {
        let counter = Arc::new(Counter::new());
        let chunk = Chunk::new(counter.clone());
        let size = 2 * REPEAT_SIZE as u64 + 100;

        let mut stream = Box::pin(chunk.upload_handler(size).unwrap());
        let mut emitted = 0u64;
        while let Some(piece) = stream.next().await {
            emitted += piece.unwrap().len() as u64;
        }

        assert_eq!(emitted, size);
        assert_eq!(counter.total(), size);
        assert_eq!(chunk.len(), size);
        // declared - remaining == bytes put on the wire
        assert_eq!(chunk.report().bytes, size);
        assert_eq!(chunk.kind(), Some(ChunkKind::UploadHttp));
    }

    #[tokio::test]
    async fn upload_stops_on_cancellation() {
        let counter = Arc::new(Counter::new());
        let chunk = Chunk::new(counter.clone());

        let mut stream = Box::pin(chunk.upload_handler(10 * REPEAT_SIZE as u64).unwrap());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), REPEAT_SIZE);

        counter.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(counter.total(), REPEAT_SIZE as u64);
    }

    #[tokio::test]
    async fn second_handler_call_is_rejected() {
        let counter = Arc::new(Counter::new());
        let chunk = Chunk::new(counter.clone());
        let _stream = chunk.upload_handler(100).unwrap();
        match chunk.upload_handler(100) {
            Err(Error::DuplicateCall) => {}
            Err(e) => panic!("expected duplicate-call error, got {e:?}"),
            Ok(_) => panic!("second handler call must fail"),
        }
        // crossing handler families is rejected the same way
        let err = chunk.download_tcp(tokio::io::empty()).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCall));
    }

    #[tokio::test]
    async fn tcp_download_counts_into_counter() {
        let counter = Arc::new(Counter::new());
        let chunk = Chunk::new(counter.clone());
        let payload = vec![0x55u8; 20_000];
        chunk.download_tcp(&payload[..]).await.unwrap();
        assert_eq!(counter.total(), 20_000);
        assert_eq!(chunk.report().bytes, 20_000);
        assert_eq!(chunk.kind(), Some(ChunkKind::DownloadTcp));
    }

    #[tokio::test]
    async fn tcp_upload_writes_declared_length() {
        let counter = Arc::new(Counter::new());
        let chunk = Chunk::new(counter.clone());
        let mut sink = Vec::new();
        let written = chunk.write_to(&mut sink, 3 * REPEAT_SIZE as u64 + 7).await.unwrap();
        assert_eq!(written, 3 * REPEAT_SIZE as u64 + 7);
        assert_eq!(sink.len() as u64, written);
        assert_eq!(counter.total(), written);
        assert!(sink.iter().all(|&b| b == 0xAA));
    }
}
