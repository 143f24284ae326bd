//! Concurrent draining of process output streams.
//!
//! Every captured stream gets a dedicated drain thread that runs from
//! the moment of spawn, so the child can never block on a full pipe
//! buffer. Data accumulates in shared in-memory buffers (or goes to a
//! file sink) and can additionally be exposed to the caller as a lazy,
//! line-oriented [`OutputLines`] iterator while the process is alive.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Sleep between reads when a non-blocking stream has no data yet.
const READ_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the line-streaming queue.
///
/// The queue is bounded: when it fills up, the drain thread blocks
/// until the caller consumes lines, drops the iterator, or enters a
/// wait call (which closes the channel). The full output still
/// accumulates in the in-memory buffer, so a slow consumer delays
/// draining but never loses data.
const LINE_QUEUE_CAPACITY: usize = 256;

/// Final output captured from a finished command.
///
/// `stderr` is empty when the stream was merged into stdout (the
/// default, and always the case for remote execution) or routed to a
/// file.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// Text captured from stdout.
    pub stdout: String,
    /// Text captured from stderr, if it was routed separately.
    pub stderr: String,
}

impl CapturedOutput {
    /// Stdout with surrounding whitespace trimmed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Iterate over stdout lines.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// Lazy sequence of output lines from a running process.
///
/// Each call to `next` blocks until a complete line is available or the
/// process has exited and all buffered output has been delivered, at
/// which point the sequence ends. Lines are whitespace-trimmed.
///
/// The same bytes also accumulate in the handle's in-memory buffer, so
/// the output returned by a later wait call always contains the lines
/// already streamed here. A wait call on the handle closes the channel:
/// the iterator then yields whatever was already queued and ends.
pub struct OutputLines {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl Iterator for OutputLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .blocking_recv()
    }
}

impl std::fmt::Debug for OutputLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLines").finish_non_exhaustive()
    }
}

/// Shared accumulation buffer for one stream.
pub(crate) type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Open a file sink for appending, creating it if missing.
pub(crate) fn open_sink_file(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    std::fs::File::options().create(true).append(true).open(path)
}

/// Where a drain thread puts the bytes it reads.
pub(crate) enum DrainTarget {
    /// Append to an in-memory buffer.
    Buffer(SharedBuf),
    /// Write through to a file, flushed when the stream ends.
    File(std::fs::File),
    /// Read and drop.
    Discard,
}

/// Receiver side of one line channel. The collector keeps a handle to
/// the receiver even after the iterator has been claimed, so a wait
/// call can close the channel and wake a producer blocked on it.
struct LineChannel {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    claimed: bool,
}

/// Owns the buffers, drain threads and line channels of one spawned
/// command.
pub(crate) struct OutputCollector {
    stdout_buf: SharedBuf,
    stderr_buf: SharedBuf,
    threads: Vec<JoinHandle<()>>,
    stdout_lines: Option<LineChannel>,
    stderr_lines: Option<LineChannel>,
    normalize: bool,
}

impl OutputCollector {
    /// Create an empty collector. `normalize` enables the PTY cleanup
    /// applied to remote output (`\r\n` to `\n`, `^C` echo removal).
    pub(crate) fn new(normalize: bool) -> Self {
        Self {
            stdout_buf: Arc::new(Mutex::new(Vec::new())),
            stderr_buf: Arc::new(Mutex::new(Vec::new())),
            threads: Vec::new(),
            stdout_lines: None,
            stderr_lines: None,
            normalize,
        }
    }

    pub(crate) fn stdout_buffer(&self) -> SharedBuf {
        Arc::clone(&self.stdout_buf)
    }

    pub(crate) fn stderr_buffer(&self) -> SharedBuf {
        Arc::clone(&self.stderr_buf)
    }

    /// Create the stdout line channel and return the producer side.
    pub(crate) fn make_stdout_lines(&mut self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        self.stdout_lines = Some(LineChannel::new(rx));
        tx
    }

    /// Create the stderr line channel and return the producer side.
    pub(crate) fn make_stderr_lines(&mut self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        self.stderr_lines = Some(LineChannel::new(rx));
        tx
    }

    pub(crate) fn take_stdout_lines(&mut self) -> Option<OutputLines> {
        self.stdout_lines.as_mut().and_then(LineChannel::claim)
    }

    pub(crate) fn take_stderr_lines(&mut self) -> Option<OutputLines> {
        self.stderr_lines.as_mut().and_then(LineChannel::claim)
    }

    /// Close both line channels, claimed or not. Producers blocked on a
    /// full queue wake up immediately; a claimed iterator still yields
    /// the lines already queued, then ends.
    pub(crate) fn close_line_streams(&mut self) {
        for chan in self.stdout_lines.iter().chain(self.stderr_lines.iter()) {
            chan.rx.lock().unwrap_or_else(|e| e.into_inner()).close();
        }
    }

    /// Start a drain thread for one stream.
    pub(crate) fn spawn_drain<R>(
        &mut self,
        reader: R,
        target: DrainTarget,
        lines: Option<mpsc::Sender<String>>,
    ) where
        R: Read + Send + 'static,
    {
        let normalize = self.normalize;
        let handle = thread::Builder::new()
            .name("cmdbridge-drain".into())
            .spawn(move || drain_stream(reader, target, lines, normalize))
            .expect("failed to spawn drain thread");
        self.threads.push(handle);
    }

    /// Wait for all drain threads to hit end-of-stream.
    pub(crate) fn finalize(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Decode the accumulated buffers.
    pub(crate) fn output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: decode_buffer(&self.stdout_buf, self.normalize),
            stderr: decode_buffer(&self.stderr_buf, self.normalize),
        }
    }
}

impl LineChannel {
    fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
            claimed: false,
        }
    }

    /// Hand out the iterator once; later claims get `None`.
    fn claim(&mut self) -> Option<OutputLines> {
        if self.claimed {
            return None;
        }
        self.claimed = true;
        Some(OutputLines {
            rx: Arc::clone(&self.rx),
        })
    }
}

fn decode_buffer(buf: &SharedBuf, normalize: bool) -> String {
    let bytes = buf.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if normalize {
        text = text.replace("\r\n", "\n").replace("^C", "");
    }
    text
}

fn drain_stream<R: Read>(
    mut reader: R,
    mut target: DrainTarget,
    mut lines: Option<mpsc::Sender<String>>,
    normalize: bool,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut assembler = LineAssembler::new(normalize);

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                match &mut target {
                    DrainTarget::Buffer(shared) => {
                        shared
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend_from_slice(&buf[..n]);
                    }
                    DrainTarget::File(file) => {
                        if file.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    DrainTarget::Discard => {}
                }

                let mut consumer_gone = false;
                if let Some(tx) = lines.as_ref() {
                    for line in assembler.push(&buf[..n]) {
                        if tx.blocking_send(line).is_err() {
                            consumer_gone = true;
                            break;
                        }
                    }
                }
                if consumer_gone {
                    lines = None;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(READ_RETRY_INTERVAL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }

    if let Some(tx) = lines.as_ref() {
        if let Some(last) = assembler.flush() {
            let _ = tx.blocking_send(last);
        }
    }
    if let DrainTarget::File(file) = &mut target {
        let _ = file.flush();
    }
}

/// Reassembles a byte stream into trimmed lines, carrying partial lines
/// across chunk boundaries.
struct LineAssembler {
    partial: Vec<u8>,
    normalize: bool,
}

impl LineAssembler {
    fn new(normalize: bool) -> Self {
        Self {
            partial: Vec::new(),
            normalize,
        }
    }

    /// Feed a chunk, returning every line completed by it.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let rest = self.partial.split_off(pos + 1);
            let line = std::mem::replace(&mut self.partial, rest);
            out.push(self.decode(&line));
        }
        out
    }

    /// Return the trailing partial line, if any.
    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.partial);
        Some(self.decode(&line))
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let mut line = String::from_utf8_lossy(bytes).into_owned();
        if self.normalize {
            line = line.replace("^C", "");
        }
        line.trim().to_string()
    }
}
