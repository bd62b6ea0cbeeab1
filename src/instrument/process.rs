//! Process-link (IPT) reader over a line-oriented TCP protocol.
//!
//! Each read sends the configured request followed by CRLF and waits for one line of
//! `name=value` pairs separated by `;`:
//!
//! ```text
//! -> IPT?\r\n
//! <- FCurrent1=2.0000000E-006;FCurrent2=3.0000000E-006;Temp=21.5\r\n
//! ```
//!
//! A line starting with `ERR` is the transmitter reporting a fault.

use crate::core::{Endpoint, LinkKind, LinkReader, ProcessSample, CURRENT1_FIELD, CURRENT2_FIELD};
use crate::error::{AppResult, DaqError};
use crate::instrument::access::Phase;
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Longest response line accepted before the exchange is declared garbage.
pub const MAX_LINE_LEN: usize = 4096;

/// Line-protocol client for the process-instrumentation transmitter.
pub struct ProcessLinkReader {
    request: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    phase: Phase,
}

impl ProcessLinkReader {
    /// Reader sending `request` once per read.
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            stream: None,
            buffer: BytesMut::with_capacity(512),
            phase: Phase::Fresh,
        }
    }

    /// Upper bound on the TCP connect. Default: 3 seconds.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upper bound on one exchange. Default: 1 second.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn read_error(reason: impl Into<String>) -> DaqError {
        DaqError::Read {
            link: LinkKind::Process,
            reason: reason.into(),
        }
    }

    /// Send the request and collect one response line, without the terminator.
    async fn exchange(&mut self) -> AppResult<String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Self::read_error("not connected"))?;

        // Leftovers belong to an exchange that was abandoned.
        if !self.buffer.is_empty() {
            debug!("discarding {} stale bytes", self.buffer.len());
            self.buffer.clear();
        }
        let mut scratch = [0u8; 256];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => return Err(Self::read_error("connection closed by peer")),
                Ok(n) => debug!("discarding {} stale bytes", n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Self::read_error(e.to_string())),
            }
        }

        let command = format!("{}\r\n", self.request);
        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Self::read_error(e.to_string()))?;

        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                return Ok(text);
            }
            if self.buffer.len() > MAX_LINE_LEN {
                self.buffer.clear();
                return Err(DaqError::Protocol {
                    link: LinkKind::Process,
                    reason: format!("response exceeds {} bytes without terminator", MAX_LINE_LEN),
                });
            }
            let n = stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| Self::read_error(e.to_string()))?;
            if n == 0 {
                return Err(Self::read_error("connection closed by peer"));
            }
        }
    }
}

#[async_trait]
impl LinkReader for ProcessLinkReader {
    type Sample = ProcessSample;

    fn kind(&self) -> LinkKind {
        LinkKind::Process
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()> {
        let connection_error = |reason: String| DaqError::Connection {
            link: LinkKind::Process,
            endpoint: endpoint.to_string(),
            reason,
        };
        if self.phase != Phase::Fresh {
            return Err(connection_error(
                "reader instance already used; build a new one".into(),
            ));
        }

        info!("Connecting to {} at {}", LinkKind::Process, endpoint);
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| connection_error(format!("timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| connection_error(e.to_string()))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.phase = Phase::Open;
        Ok(())
    }

    async fn read(&mut self) -> AppResult<ProcessSample> {
        if self.phase != Phase::Open {
            return Err(Self::read_error("not connected"));
        }
        let timeout = self.read_timeout;
        let line = match tokio::time::timeout(timeout, self.exchange()).await {
            Ok(line) => line?,
            Err(_) => {
                // Partial bytes of the late reply would corrupt the next exchange.
                self.buffer.clear();
                return Err(Self::read_error(format!("timed out after {:?}", timeout)));
            }
        };
        debug!(%line, "process record received");
        parse_record(&line, Utc::now())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if self.phase != Phase::Open {
            return Ok(());
        }
        self.phase = Phase::Closed;
        self.buffer.clear();
        info!("Disconnecting from {}", LinkKind::Process);
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("process link shutdown: {}", e);
            }
        }
        Ok(())
    }
}

/// Parse one response line into a [`ProcessSample`].
///
/// Both calibrated currents must be present. Empty segments are ignored so a trailing
/// `;` is harmless.
pub fn parse_record(line: &str, captured_at: DateTime<Utc>) -> AppResult<ProcessSample> {
    let protocol_error = |reason: String| DaqError::Protocol {
        link: LinkKind::Process,
        reason,
    };

    let line = line.trim();
    if line.starts_with("ERR") {
        return Err(protocol_error(format!("transmitter error response: {}", line)));
    }

    let mut current1 = None;
    let mut current2 = None;
    let mut sample = ProcessSample::new(captured_at, 0.0, 0.0);

    for pair in line.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| protocol_error(format!("malformed field '{}'", pair)))?;
        let name = name.trim();
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| protocol_error(format!("field {} has non-numeric value '{}'", name, value)))?;

        match name {
            CURRENT1_FIELD => current1 = Some(value),
            CURRENT2_FIELD => current2 = Some(value),
            _ => {
                sample.fields.insert(name.to_string(), value);
            }
        }
    }

    match (current1, current2) {
        (Some(j1), Some(j2)) => {
            sample.current1 = j1;
            sample.current2 = j2;
            Ok(sample)
        }
        _ => Err(protocol_error(format!(
            "record lacks {} or {}",
            CURRENT1_FIELD, CURRENT2_FIELD
        ))),
    }
}

/// Render a sample in wire form. Used by the emulator.
pub fn format_record(sample: &ProcessSample) -> String {
    let mut line = format!(
        "{}={:.7E};{}={:.7E}",
        CURRENT1_FIELD, sample.current1, CURRENT2_FIELD, sample.current2
    );
    for (name, value) in &sample.fields {
        line.push_str(&format!(";{}={}", name, value));
    }
    line
}
