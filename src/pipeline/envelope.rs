//! Messages between stage processes.
//!
//! Every message is one JSON document on its own line:
//!
//! ```text
//! {"version":1,"stage":"parser","payload":{"kind":"readings","data":[...]}}
//! ```
//!
//! A stage's output ends with a `sentinel` payload. A stream that stops without one means the
//! sender died, and the receiver treats it as a protocol error rather than a clean end.

use std::io::{BufRead, BufWriter, Write};

use serde::{Deserialize, Serialize};

use super::Stage;
use crate::aggregate::Window;
use crate::error::{AnalysisError, Result};
use crate::reading::Reading;
use crate::window::WindowReport;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// The sending stage.
    pub stage: Stage,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Lines(Vec<String>),
    Readings(Vec<Reading>),
    Window(Window),
    Report(WindowReport),
    Sentinel,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Lines(_) => "lines",
            Payload::Readings(_) => "readings",
            Payload::Window(_) => "window",
            Payload::Report(_) => "report",
            Payload::Sentinel => "sentinel",
        }
    }
}

pub struct EnvelopeWriter<W: Write> {
    stage: Stage,
    writer: BufWriter<W>,
    sent: u64,
}

impl<W: Write> EnvelopeWriter<W> {
    pub fn new(stage: Stage, writer: W) -> Self {
        Self { stage, writer: BufWriter::new(writer), sent: 0 }
    }

    pub fn send(&mut self, payload: Payload) -> Result<()> {
        let envelope = Envelope { version: PROTOCOL_VERSION, stage: self.stage, payload };
        serde_json::to_writer(&mut self.writer, &envelope)
            .map_err(|error| AnalysisError::stage_failed(self.stage, format!("cannot send message: {error}")))?;
        self.writer
            .write_all(b"\n")
            .map_err(|error| AnalysisError::stage_failed(self.stage, format!("cannot send message: {error}")))?;
        self.sent += 1;
        Ok(())
    }

    /// Sends the end-of-stream marker and flushes. Returns how many messages went out, marker
    /// included.
    pub fn close(mut self) -> Result<u64> {
        self.send(Payload::Sentinel)?;
        self.writer
            .flush()
            .map_err(|error| AnalysisError::stage_failed(self.stage, format!("cannot flush output: {error}")))?;
        Ok(self.sent)
    }
}

/// Reads the stream of one upstream stage, checking version and sender on every message.
pub struct EnvelopeReader<R: BufRead> {
    upstream: Stage,
    reader: R,
    line: String,
    finished: bool,
}

impl<R: BufRead> EnvelopeReader<R> {
    pub fn new(upstream: Stage, reader: R) -> Self {
        Self { upstream, reader, line: String::new(), finished: false }
    }

    /// Next payload, or `None` once the sentinel has arrived.
    pub fn recv(&mut self) -> Result<Option<Payload>> {
        if self.finished {
            return Ok(None);
        }
        self.line.clear();
        let read = self
            .reader
            .read_line(&mut self.line)
            .map_err(|error| AnalysisError::protocol(self.upstream, format!("cannot read message: {error}")))?;
        if read == 0 {
            return Err(AnalysisError::protocol(self.upstream, "stream ended without end-of-stream marker"));
        }

        let envelope: Envelope = serde_json::from_str(self.line.trim_end())
            .map_err(|error| AnalysisError::protocol(self.upstream, format!("malformed message: {error}")))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(AnalysisError::protocol(
                self.upstream,
                format!("protocol version {} (expected {PROTOCOL_VERSION})", envelope.version),
            ));
        }
        if envelope.stage != self.upstream {
            return Err(AnalysisError::protocol(
                self.upstream,
                format!("message from unexpected stage `{}`", envelope.stage),
            ));
        }

        match envelope.payload {
            Payload::Sentinel => {
                self.finished = true;
                Ok(None)
            }
            payload => Ok(Some(payload)),
        }
    }
}
