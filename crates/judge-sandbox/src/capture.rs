use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Bytes captured from one of the child's output streams, capped at `cap`.
///
/// The draining thread keeps reading past the cap (so the child never blocks on a
/// full pipe) but drops the excess and raises `exceeded`.
#[derive(Debug)]
pub(crate) struct CapturedStream {
    buf: Mutex<Vec<u8>>,
    exceeded: AtomicBool,
    cap: usize,
}

impl CapturedStream {
    fn new(cap: usize) -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            exceeded: AtomicBool::new(false),
            cap,
        }
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let remaining = self.cap.saturating_sub(buf.len());
        if chunk.len() <= remaining {
            buf.extend_from_slice(chunk);
        } else {
            buf.extend_from_slice(&chunk[..remaining]);
            self.exceeded.store(true, Ordering::Release);
        }
    }
}

pub(crate) fn drain_capped<R: Read>(mut reader: R, sink: &CapturedStream) -> std::io::Result<()> {
    let mut tmp = [0u8; 8192];
    loop {
        let n = match reader.read(&mut tmp) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if sink.exceeded() {
            continue;
        }
        sink.push(&tmp[..n]);
    }
}

pub(crate) fn spawn_capture<R: Read + Send + 'static>(
    reader: R,
    cap: usize,
) -> std::io::Result<(Arc<CapturedStream>, JoinHandle<()>)> {
    let sink = Arc::new(CapturedStream::new(cap));
    let thread_sink = Arc::clone(&sink);
    let thread = std::thread::Builder::new()
        .name("judge-capture".to_string())
        .spawn(move || {
            let _ = drain_capped(reader, &thread_sink);
        })?;
    Ok((sink, thread))
}

/// One message read from the child's protocol stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Line(String),
    TooLong,
    Garbled(String),
}

pub(crate) fn read_frame<R: BufRead>(reader: &mut R, cap: usize) -> std::io::Result<Option<Frame>> {
    let mut buf = Vec::new();
    let limit = u64::try_from(cap).unwrap_or(u64::MAX).saturating_add(1);
    let n = reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > cap {
            return Ok(Some(Frame::TooLong));
        }
        // EOF in the middle of a line: the child died while writing.
        return Ok(None);
    }
    buf.pop();
    match String::from_utf8(buf) {
        Ok(line) => Ok(Some(Frame::Line(line))),
        Err(err) => Ok(Some(Frame::Garbled(err.to_string()))),
    }
}

/// Reads frames on a dedicated thread. The channel disconnects on EOF, on a read
/// error, or after the first oversized frame.
pub(crate) fn spawn_frame_reader<R: Read + Send + 'static>(
    reader: R,
    cap: usize,
) -> std::io::Result<Receiver<Frame>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("judge-frames".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            while let Ok(Some(frame)) = read_frame(&mut reader, cap) {
                let stop = frame == Frame::TooLong;
                if tx.send(frame).is_err() || stop {
                    break;
                }
            }
        })?;
    Ok(rx)
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Writes request frames on a dedicated thread, so a child that stops reading its
/// stdin cannot block the caller past its deadline. The thread exits when the pipe
/// breaks (the child was killed) or every sender is dropped.
pub(crate) fn spawn_frame_writer<W: Write + Send + 'static>(
    writer: W,
) -> std::io::Result<Sender<String>> {
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("judge-requests".to_string())
        .spawn(move || {
            let mut writer = writer;
            for line in rx {
                if write_frame(&mut writer, &line).is_err() {
                    break;
                }
            }
        })?;
    Ok(tx)
}
