use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 8192;
const CHANNEL_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Bounded stdout/stderr of one run, plus both interleaved in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub combined: Vec<u8>,
    /// stdout or stderr went past the cap and the excess was discarded
    pub truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, stream: Stream, chunk: &[u8], cap: usize) {
        let buf = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let room = cap.saturating_sub(buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let room = cap.saturating_sub(self.combined.len());
        self.combined.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Drains a child's pipes concurrently with its execution.
pub struct OutputCapture {
    readers: Vec<JoinHandle<()>>,
    collector: JoinHandle<()>,
    state: Arc<Mutex<CapturedOutput>>,
}

impl OutputCapture {
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, cap: u64) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let cap = usize::try_from(cap).unwrap_or(usize::MAX);
        let (tx, mut rx) = mpsc::channel::<(Stream, Vec<u8>)>(CHANNEL_DEPTH);
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = stdout {
            readers.push(tokio::spawn(read_stream(pipe, Stream::Stdout, cap, tx.clone())));
        }
        if let Some(pipe) = stderr {
            readers.push(tokio::spawn(read_stream(pipe, Stream::Stderr, cap, tx.clone())));
        }
        drop(tx);

        let state = Arc::new(Mutex::new(CapturedOutput::default()));
        let sink = Arc::clone(&state);
        let collector = tokio::spawn(async move {
            while let Some((stream, chunk)) = rx.recv().await {
                if let Ok(mut out) = sink.lock() {
                    out.push(stream, &chunk, cap);
                }
            }
        });

        Self {
            readers,
            collector,
            state,
        }
    }

    /// Wait up to `grace` for both pipes to close, then return whatever was
    /// captured.
    pub async fn finish(self, grace: Duration) -> CapturedOutput {
        let Self {
            readers,
            mut collector,
            state,
        } = self;

        if tokio::time::timeout(grace, &mut collector).await.is_err() {
            tracing::warn!("output pipes still open after process exit, abandoning readers");
            for reader in &readers {
                reader.abort();
            }
            collector.abort();
        }

        let captured = state.lock().map(|out| out.clone());
        captured.unwrap_or_default()
    }
}

/// Decode captured bytes as text no longer than `cap` bytes. A character cut
/// in half by the cap is dropped rather than replaced, and replacement
/// characters for invalid bytes cannot push the text past the cap.
pub fn decode_capped(bytes: &[u8], cap: u64) -> String {
    let mut end = bytes.len();
    let tail = end.saturating_sub(4);
    if let Some(offset) = bytes[tail..].iter().rposition(|b| b & 0xC0 != 0x80) {
        let lead = tail + offset;
        if lead + utf8_width(bytes[lead]) > end {
            end = lead;
        }
    }

    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    if text.len() > cap {
        let mut cut = cap;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

/// Forward a pipe to the collector. Past the cap the reader keeps draining
/// so the child never blocks on a full pipe, but only one more chunk is sent
/// to mark truncation.
async fn read_stream<R>(mut pipe: R, stream: Stream, cap: usize, tx: mpsc::Sender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut forwarded = 0usize;
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if forwarded > cap {
            continue;
        }
        forwarded += n;
        if tx.send((stream, buf[..n].to_vec())).await.is_err() {
            break;
        }
    }
}
