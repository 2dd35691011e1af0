//! Bounded output capture
//!
//! Backends produce chunks into a bounded channel; the executor consumes them
//! into an `OutputCapture` that stops growing at a fixed byte cap. Chunks past
//! the cap are still received (so producers never stall on a full pipe) but
//! discarded.

use tokio::sync::mpsc;

/// Chunks buffered between a backend's reader tasks and the consumer
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Consumer end of one step's output. Ends when every producer is done.
pub type OutputStream = mpsc::Receiver<OutputChunk>;

/// Producer end handed to backend reader tasks
pub type OutputSink = mpsc::Sender<OutputChunk>;

pub fn output_channel() -> (OutputSink, OutputStream) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Output of one finished step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Both streams in arrival order
    pub combined: String,
    /// Set when output beyond the cap was discarded
    pub truncated: bool,
}

#[derive(Debug)]
pub struct OutputCapture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            combined: Vec::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        let used = self.stdout.len() + self.stderr.len();
        let room = self.limit.saturating_sub(used);
        let take = chunk.data.len().min(room);
        if take < chunk.data.len() {
            self.truncated = true;
        }
        if take == 0 {
            return;
        }

        let data = &chunk.data[..take];
        match chunk.kind {
            StreamKind::Stdout => self.stdout.extend_from_slice(data),
            StreamKind::Stderr => self.stderr.extend_from_slice(data),
        }
        self.combined.extend_from_slice(data);
    }

    /// Receive until the stream ends. Cancel-safe: dropping this future
    /// keeps everything received so far.
    pub async fn consume(&mut self, stream: &mut OutputStream) {
        while let Some(chunk) = stream.recv().await {
            self.push(chunk);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            combined: String::from_utf8_lossy(&self.combined).into_owned(),
            truncated: self.truncated,
        }
    }
}
