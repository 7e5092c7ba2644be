// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Byte-stream transports between a client and its backend.
//!
//! A transport hands decoded frames to the owning manager through an
//! [`Inbox`]. Everything it delivers is tagged with the client id and the
//! session number the client was on when the transport was started, so frames
//! from a replaced process can be recognised and dropped.

use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::error::TransportError;
use super::protocol;

/// How long a closed backend gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Stable identity of a client inside one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a transport stopped delivering frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The backend closed its output stream.
    EndOfStream,
    /// Reading failed.
    ReadError(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("backend closed its output"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
        }
    }
}

/// Something a transport observed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One complete frame body.
    Frame(Bytes),
    /// No more frames will arrive for this session.
    Closed(CloseReason),
}

/// A transport event addressed to one client session.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Receiving client.
    pub client: ClientId,
    /// Session the event belongs to.
    pub session: u64,
    /// The event itself.
    pub event: TransportEvent,
}

/// Sending half of the manager's delivery channel.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
/// Receiving half of the manager's delivery channel.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Where a transport pushes what it reads.
#[derive(Debug, Clone)]
pub struct Inbox {
    client: ClientId,
    session: u64,
    tx: DeliverySender,
}

impl Inbox {
    pub(crate) const fn new(client: ClientId, session: u64, tx: DeliverySender) -> Self {
        Self {
            client,
            session,
            tx,
        }
    }

    fn deliver(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Delivery {
                client: self.client,
                session: self.session,
                event,
            })
            .is_ok()
    }

    /// Hands one frame body to the client. Returns `false` once nobody listens.
    pub fn frame(&self, body: Bytes) -> bool {
        self.deliver(TransportEvent::Frame(body))
    }

    /// Reports the end of the stream.
    pub fn closed(&self, reason: CloseReason) -> bool {
        self.deliver(TransportEvent::Closed(reason))
    }
}

/// A bidirectional frame channel to one backend.
///
/// `start` may be called again after `close` to begin a fresh session.
pub trait Transport {
    /// Acquires the underlying stream; incoming frames go to `inbox`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    fn start(&mut self, inbox: Inbox) -> Result<(), TransportError>;

    /// Queues one encoded frame for writing, preserving send order.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not started or already closed.
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Whether `send` would currently accept a frame.
    fn is_writable(&self) -> bool;

    /// Releases the stream. Idempotent.
    fn close(&mut self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

struct ProcessSession {
    writer: mpsc::UnboundedSender<Bytes>,
    child: Child,
    reader: tokio::task::JoinHandle<()>,
}

/// Runs the backend as a child process and talks over its stdin/stdout.
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    session: Option<ProcessSession>,
}

impl StdioTransport {
    /// Describes the process to launch; nothing runs until `start`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            session: None,
        }
    }

    /// Sets the working directory of the backend.
    #[must_use]
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    async fn write_task(mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = stdin.write_all(&frame).await {
                warn!("Failed to write to backend stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!("Failed to flush backend stdin: {}", e);
                break;
            }
        }
        // Dropping stdin here closes the pipe, which most servers treat as exit.
    }

    async fn read_task(stdout: ChildStdout, inbox: Inbox) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = BytesMut::with_capacity(8192);

        let reason = loop {
            let mut chunk = [0u8; 4096];
            match reader.read(&mut chunk).await {
                Ok(0) => break CloseReason::EndOfStream,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => break CloseReason::ReadError(e.to_string()),
            }

            loop {
                match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(body)) => {
                        trace!("Backend frame: {}", String::from_utf8_lossy(&body));
                        if !inbox.frame(body) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // No way to find the next frame boundary; start over.
                        warn!("Discarding {} buffered bytes: {}", buffer.len(), e);
                        buffer.clear();
                        break;
                    }
                }
            }
        };

        debug!("Backend stream ended: {}", reason);
        inbox.closed(reason);
    }
}

impl Transport for StdioTransport {
    fn start(&mut self, inbox: Inbox) -> Result<(), TransportError> {
        self.close();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;

        let (writer, frames) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_task(stdin, frames));
        let reader = tokio::spawn(Self::read_task(stdout, inbox));

        debug!("Launched {} (pid {:?})", self.describe(), child.id());
        self.session = Some(ProcessSession {
            writer,
            child,
            reader,
        });
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotStarted)?;
        session
            .writer
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn is_writable(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.writer.is_closed())
    }

    fn close(&mut self) {
        let Some(ProcessSession {
            writer,
            mut child,
            reader,
        }) = self.session.take()
        else {
            return;
        };

        // Closing the writer lets queued frames (e.g. `exit`) drain first.
        drop(writer);
        reader.abort();

        let program = self.program.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                debug!("{} did not exit in time, killing it", program);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", program, e);
                }
            }
        });
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.reader.abort();
            // `kill_on_drop` takes care of the process.
        }
    }
}
