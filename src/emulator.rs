//! In-process emulators for both instruments.
//!
//! The access-link emulator is a minimal Modbus/TCP server that answers "read input
//! registers" with slowly drifting channel values plus noise. The process-link
//! emulator answers each request line with a record whose two currents vary slowly
//! around fixed levels. Both serve any number of clients until shut down.

use crate::config::Settings;
use crate::core::{Endpoint, ProcessSample};
use crate::error::AppResult;
use crate::instrument::modbus::{encode_exception, encode_response, MBAP_LEN, READ_INPUT_REGISTERS};
use crate::instrument::process::format_record;
use bytes::{Buf, BytesMut};
use chrono::Utc;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Modbus exception: illegal function.
const ILLEGAL_FUNCTION: u8 = 0x01;
/// Modbus exception: illegal data address.
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
/// Modbus exception: server device failure.
const DEVICE_FAILURE: u8 = 0x04;
/// Modbus exception: gateway target device failed to respond.
const TARGET_NO_RESPONSE: u8 = 0x0B;

/// Where and what to emulate.
#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    /// Listen address of the Modbus server
    pub access_bind: String,
    /// Listen address of the IPT line server
    pub process_bind: String,
    /// Input channels served
    pub channels: usize,
    /// Modbus unit the server answers to
    pub unit_id: u8,
    /// Request line the process emulator answers
    pub request: String,
}

impl EmulatorConfig {
    /// Bind both emulators on loopback with OS-assigned ports.
    pub fn loopback(channels: usize) -> Self {
        Self {
            access_bind: "127.0.0.1:0".into(),
            process_bind: "127.0.0.1:0".into(),
            channels,
            unit_id: 1,
            request: "IPT?".into(),
        }
    }

    /// Serve on the endpoints the monitor is configured to connect to.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            access_bind: settings.access_endpoint().to_string(),
            process_bind: settings.process_endpoint().to_string(),
            channels: settings.access_link.channels,
            unit_id: settings.access_link.unit_id,
            request: settings.process_link.request.clone(),
        }
    }
}

/// Fault injection and counters shared with the serving tasks.
#[derive(Debug, Default)]
pub struct EmulatorState {
    modbus_exceptions: AtomicUsize,
    modbus_requests: AtomicU64,
    process_requests: AtomicU64,
}

impl EmulatorState {
    /// Answer the next `count` Modbus requests with a device-failure exception.
    pub fn fail_next_modbus(&self, count: usize) {
        self.modbus_exceptions.store(count, Ordering::SeqCst);
    }

    /// Modbus requests answered so far.
    pub fn modbus_requests(&self) -> u64 {
        self.modbus_requests.load(Ordering::SeqCst)
    }

    /// Line requests answered so far.
    pub fn process_requests(&self) -> u64 {
        self.process_requests.load(Ordering::SeqCst)
    }

    fn take_exception(&self) -> bool {
        self.modbus_exceptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Running emulator pair. Dropping it stops both servers and their connections.
pub struct Emulator {
    access_addr: SocketAddr,
    process_addr: SocketAddr,
    state: Arc<EmulatorState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Emulator {
    /// Bind both listeners and start serving.
    pub async fn spawn(config: EmulatorConfig) -> AppResult<Self> {
        let access = TcpListener::bind(&config.access_bind).await?;
        let process = TcpListener::bind(&config.process_bind).await?;
        let access_addr = access.local_addr()?;
        let process_addr = process.local_addr()?;
        let state = Arc::new(EmulatorState::default());
        let started = Instant::now();

        let modbus = ModbusServer {
            unit_id: config.unit_id,
            channels: config.channels,
            started,
            state: state.clone(),
        };
        let ipt = LineServer {
            request: config.request.clone(),
            started,
            state: state.clone(),
        };

        let tasks = vec![
            tokio::spawn(accept_loop(access, Arc::new(modbus), ModbusServer::serve)),
            tokio::spawn(accept_loop(process, Arc::new(ipt), LineServer::serve)),
        ];
        info!(%access_addr, %process_addr, "Emulators listening");

        Ok(Self {
            access_addr,
            process_addr,
            state,
            tasks,
        })
    }

    /// Bound address of the Modbus server.
    pub fn access_endpoint(&self) -> Endpoint {
        Endpoint::new(self.access_addr.ip().to_string(), self.access_addr.port())
    }

    /// Bound address of the line server.
    pub fn process_endpoint(&self) -> Endpoint {
        Endpoint::new(self.process_addr.ip().to_string(), self.process_addr.port())
    }

    /// Counters and fault injection.
    pub fn state(&self) -> &Arc<EmulatorState> {
        &self.state
    }

    /// Stop accepting and drop every client.
    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn accept_loop<S, F, Fut>(listener: TcpListener, server: Arc<S>, serve: F)
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, TcpStream) -> Fut + Copy + Send + 'static,
    Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    let mut clients = tokio::task::JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "emulator client connected");
                let server = server.clone();
                clients.spawn(async move {
                    if let Err(e) = serve(server, socket).await {
                        debug!(%peer, "emulator client ended: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("emulator accept failed: {}", e);
                return;
            }
        }
    }
}

struct ModbusServer {
    unit_id: u8,
    channels: usize,
    started: Instant,
    state: Arc<EmulatorState>,
}

impl ModbusServer {
    async fn serve(self: Arc<Self>, mut socket: TcpStream) -> std::io::Result<()> {
        socket.set_nodelay(true)?;
        loop {
            let mut header = BytesMut::zeroed(MBAP_LEN);
            if socket.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let transaction = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let unit = header[6];
            if length < 2 {
                return Err(std::io::ErrorKind::InvalidData.into());
            }
            let mut pdu = BytesMut::zeroed(length - 1);
            socket.read_exact(&mut pdu).await?;
            self.state.modbus_requests.fetch_add(1, Ordering::SeqCst);

            let reply = self.answer(transaction, unit, pdu);
            socket.write_all(&reply).await?;
        }
    }

    fn answer(&self, transaction: u16, unit: u8, mut pdu: BytesMut) -> BytesMut {
        let function = pdu.get_u8();
        if function != READ_INPUT_REGISTERS || pdu.remaining() < 4 {
            return encode_exception(transaction, unit, function, ILLEGAL_FUNCTION);
        }
        if unit != self.unit_id {
            return encode_exception(transaction, unit, function, TARGET_NO_RESPONSE);
        }
        let start = pdu.get_u16() as usize;
        let quantity = pdu.get_u16() as usize;
        if quantity == 0 || quantity % 2 != 0 || start % 2 != 0 || (start + quantity) / 2 > self.channels {
            return encode_exception(transaction, unit, function, ILLEGAL_DATA_ADDRESS);
        }
        if self.state.take_exception() {
            return encode_exception(transaction, unit, function, DEVICE_FAILURE);
        }

        let values = synthesize(self.started.elapsed().as_secs_f64(), self.channels);
        let first = start / 2;
        encode_response(transaction, unit, &values[first..first + quantity / 2])
    }
}

/// Channel `i` drifts around `10 * (i + 1)` with a period of a minute, plus noise.
fn synthesize(t: f64, channels: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..channels)
        .map(|i| {
            let base = 10.0 * (i as f64 + 1.0);
            let drift = 0.02 * base * (std::f64::consts::TAU * t / 60.0 + i as f64).sin();
            let noise = rng.gen_range(-0.001..0.001) * base;
            (base + drift + noise) as f32
        })
        .collect()
}

struct LineServer {
    request: String,
    started: Instant,
    state: Arc<EmulatorState>,
}

impl LineServer {
    async fn serve(self: Arc<Self>, socket: TcpStream) -> std::io::Result<()> {
        socket.set_nodelay(true)?;
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Some(line) = lines.next_line().await? {
            self.state.process_requests.fetch_add(1, Ordering::SeqCst);
            let reply = if line.trim() == self.request {
                format_record(&self.record())
            } else {
                format!("ERR unknown command '{}'", line.trim())
            };
            write.write_all(reply.as_bytes()).await?;
            write.write_all(b"\r\n").await?;
        }
        Ok(())
    }

    /// Currents wander ±5% around 2 µA and 3 µA over a two-minute period.
    fn record(&self) -> ProcessSample {
        let t = self.started.elapsed().as_secs_f64();
        let phase = std::f64::consts::TAU * t / 120.0;
        ProcessSample::new(
            Utc::now(),
            2.0e-6 * (1.0 + 0.05 * phase.sin()),
            3.0e-6 * (1.0 + 0.05 * (phase + 1.0).sin()),
        )
        .with_field("Temp", 21.5 + phase.cos())
        .with_field("Pressure", 101.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_values_stay_near_base() {
        let values = synthesize(12.5, 15);
        assert_eq!(values.len(), 15);
        for (i, value) in values.iter().enumerate() {
            let base = 10.0 * (i as f32 + 1.0);
            assert!((value - base).abs() <= 0.03 * base, "channel {i}: {value}");
        }
    }

    #[test]
    fn test_out_of_range_request_is_exception() {
        let server = ModbusServer {
            unit_id: 1,
            channels: 2,
            started: Instant::now(),
            state: Arc::default(),
        };
        let mut pdu = BytesMut::new();
        pdu.extend_from_slice(&[READ_INPUT_REGISTERS, 0, 0, 0, 6]);
        let reply = server.answer(7, 1, pdu);
        assert_eq!(&reply[MBAP_LEN..], &[READ_INPUT_REGISTERS | 0x80, ILLEGAL_DATA_ADDRESS]);
    }

    #[test]
    fn test_injected_exceptions_run_out() {
        let state = EmulatorState::default();
        state.fail_next_modbus(1);
        assert!(state.take_exception());
        assert!(!state.take_exception());
    }
}
