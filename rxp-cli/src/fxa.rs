//! File transfer application framing
//!
//! Requests and files travel over one RxP byte stream. Every message starts
//! with a `"<command> <filename>|SEPARATOR|"` header. `get` asks the peer for
//! a file; `file` is followed by the file bytes and a `|END` marker.

use bytes::{Buf, Bytes, BytesMut};
use rxp::{Connection, ConnectionError};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ends a message header
pub const SEPARATOR: &[u8] = b"|SEPARATOR|";

/// Ends a file body
pub const END: &[u8] = b"|END";

/// Longest header accepted before a separator must have appeared
const MAX_HEADER: usize = 1024;

/// Transfer errors
#[derive(Error, Debug)]
pub enum FxaError {
    #[error("Malformed header: {0:?}")]
    MalformedHeader(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Header exceeds 1024 bytes without a separator")]
    HeaderTooLong,

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// What the reader recognised in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Peer requests a file
    Get(String),
    /// A file body begins
    FileStart(String),
    /// Part of the current file body
    FileChunk(Bytes),
    /// The current file body is complete
    FileEnd,
}

/// Incremental parser for the framed byte stream
///
/// Markers may be split across any number of `push` calls.
#[derive(Debug, Default)]
pub struct FrameReader {
    pending: BytesMut,
    in_file: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a file body is being read
    pub fn in_file(&self) -> bool {
        self.in_file
    }

    /// Feed received bytes and collect the events they complete
    ///
    /// A bad header is reported on its own: when events precede it in the
    /// same call, those are returned and the header stays buffered, so the
    /// next call (`push(&[])` is enough) reports it and skips past it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<FrameEvent>, FxaError> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.in_file {
                match find(&self.pending, END) {
                    Some(idx) => {
                        let body = self.pending.split_to(idx).freeze();
                        self.pending.advance(END.len());
                        if !body.is_empty() {
                            events.push(FrameEvent::FileChunk(body));
                        }
                        events.push(FrameEvent::FileEnd);
                        self.in_file = false;
                    }
                    None => {
                        // keep a possible partial marker for the next push
                        let safe = self.pending.len().saturating_sub(END.len() - 1);
                        if safe > 0 {
                            events.push(FrameEvent::FileChunk(self.pending.split_to(safe).freeze()));
                        }
                        break;
                    }
                }
            } else {
                let Some(idx) = find(&self.pending, SEPARATOR) else {
                    if self.pending.len() > MAX_HEADER && events.is_empty() {
                        self.pending.clear();
                        return Err(FxaError::HeaderTooLong);
                    }
                    break;
                };
                match parse_header(&self.pending[..idx]) {
                    Ok(event) => {
                        self.pending.advance(idx + SEPARATOR.len());
                        self.in_file = matches!(event, FrameEvent::FileStart(_));
                        events.push(event);
                    }
                    Err(e) if events.is_empty() => {
                        self.pending.advance(idx + SEPARATOR.len());
                        return Err(e);
                    }
                    Err(_) => break,
                }
            }
        }
        Ok(events)
    }
}

fn parse_header(header: &[u8]) -> Result<FrameEvent, FxaError> {
    let text = String::from_utf8_lossy(header);
    let Some((command, name)) = text.trim().split_once(' ') else {
        return Err(FxaError::MalformedHeader(text.into_owned()));
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(FxaError::MalformedHeader(text.into_owned()));
    }

    match command {
        "get" => Ok(FrameEvent::Get(name)),
        "file" => Ok(FrameEvent::FileStart(name)),
        other => Err(FxaError::UnknownCommand(other.to_string())),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Ask the peer for `name`
pub fn request_file(connection: &Connection, name: &str) -> Result<(), FxaError> {
    connection.send(&format!("get {}", name), Some(SEPARATOR))?;
    Ok(())
}

/// Send `contents` to the peer as file `name`
pub fn send_file(connection: &Connection, name: &str, contents: &[u8]) -> Result<(), FxaError> {
    let mut body = Vec::with_capacity(SEPARATOR.len() + contents.len() + END.len());
    body.extend_from_slice(SEPARATOR);
    body.extend_from_slice(contents);
    body.extend_from_slice(END);
    connection.send(&format!("file {}", name), Some(&body))?;
    Ok(())
}

/// Reduce a peer-supplied name to a plain file name
fn sanitize(name: &str) -> Result<&str, FxaError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FxaError::InvalidFileName(name.to_string()))
}

/// One side of a transfer: serves `get` requests from, and stores received
/// files in, a directory
pub struct Session {
    root: PathBuf,
    reader: FrameReader,
    current: Option<(PathBuf, File, u64)>,
}

impl Session {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Session {
            root: root.into(),
            reader: FrameReader::new(),
            current: None,
        }
    }

    /// Feed received bytes; returns the paths of files completed by them
    pub fn on_bytes(
        &mut self,
        connection: &Connection,
        bytes: &[u8],
    ) -> Result<Vec<PathBuf>, FxaError> {
        let mut completed = Vec::new();
        let mut events = self.reader.push(bytes)?;
        while !events.is_empty() {
            for event in events {
                if let Some(path) = self.on_event(connection, event)? {
                    completed.push(path);
                }
            }
            // surfaces a bad header held back behind the events just handled
            events = self.reader.push(&[])?;
        }
        Ok(completed)
    }

    fn on_event(
        &mut self,
        connection: &Connection,
        event: FrameEvent,
    ) -> Result<Option<PathBuf>, FxaError> {
        match event {
            FrameEvent::Get(name) => {
                let path = self.root.join(sanitize(&name)?);
                let contents = fs::read(&path)?;
                tracing::info!(
                    "Sending {} ({})",
                    path.display(),
                    crate::stats::format_bytes(contents.len() as u64)
                );
                send_file(connection, &name, &contents)?;
            }
            FrameEvent::FileStart(name) => {
                let path = self.root.join(sanitize(&name)?);
                let file = File::create(&path)?;
                tracing::info!("Receiving {}", path.display());
                self.current = Some((path, file, 0));
            }
            FrameEvent::FileChunk(chunk) => {
                if let Some((_, file, written)) = self.current.as_mut() {
                    file.write_all(&chunk)?;
                    *written += chunk.len() as u64;
                }
            }
            FrameEvent::FileEnd => {
                if let Some((path, mut file, written)) = self.current.take() {
                    file.flush()?;
                    tracing::info!(
                        "Received {} ({})",
                        path.display(),
                        crate::stats::format_bytes(written)
                    );
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }
}
