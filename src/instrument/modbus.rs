//! Modbus/TCP access-link driver.
//!
//! Each channel is an IEEE-754 `f32` spread over two consecutive input registers,
//! high word first. One read is a single "read input registers" (function 0x04)
//! transaction covering the whole channel block.
//!
//! ```text
//! request : tid(2) proto=0(2) len=6(2) unit(1) | 0x04 start(2) quantity(2)
//! response: tid(2) proto=0(2) len(2)   unit(1) | 0x04 byte_count(1) data(byte_count)
//! error   : tid(2) proto=0(2) len=3(2) unit(1) | 0x84 exception(1)
//! ```

use crate::core::{DriverSignal, Endpoint, LinkKind};
use crate::error::{AppResult, DaqError};
use crate::instrument::access::AccessDriver;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Function code for "read input registers".
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;
/// Largest register count one request may ask for.
pub const MAX_REGISTERS: usize = 125;
/// Size of the MBAP header.
pub const MBAP_LEN: usize = 7;

/// Driver error code used for transport failures (connection lost, reset).
pub const TRANSPORT_FAULT: i32 = -1;

/// Modbus/TCP client implementing the access-link driver boundary.
pub struct ModbusTcpDriver {
    unit_id: u8,
    start_register: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    transaction: u16,
    signals: broadcast::Sender<DriverSignal>,
}

impl ModbusTcpDriver {
    /// Unconnected driver reading from `start_register` on unit `unit_id`.
    pub fn new(unit_id: u8, start_register: u16) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            unit_id,
            start_register,
            connect_timeout: Duration::from_secs(3),
            stream: None,
            transaction: 0,
            signals,
        }
    }

    /// Upper bound on the TCP connect. Default: 3 seconds.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether a transport is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn emit(&self, signal: DriverSignal) {
        let _ = self.signals.send(signal);
    }

    /// Drop the transport after an I/O failure and announce it.
    fn lose_link(&mut self, err: &std::io::Error) -> DaqError {
        warn!("Modbus link lost: {}", err);
        self.stream = None;
        self.emit(DriverSignal::Error {
            code: TRANSPORT_FAULT,
            message: err.to_string(),
        });
        self.emit(DriverSignal::Disconnected);
        DaqError::Read {
            link: LinkKind::Access,
            reason: err.to_string(),
        }
    }

    async fn transact(&mut self, request: &[u8]) -> std::io::Result<(BytesMut, BytesMut)> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;

        discard_stale(stream)?;
        stream.write_all(request).await?;

        let mut header = BytesMut::zeroed(MBAP_LEN);
        stream.read_exact(&mut header).await?;
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("MBAP length {} too short", length),
            ));
        }
        // Length counts the unit id, which is already in the header.
        let mut pdu = BytesMut::zeroed(length - 1);
        stream.read_exact(&mut pdu).await?;
        Ok((header, pdu))
    }
}

#[async_trait]
impl AccessDriver for ModbusTcpDriver {
    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()> {
        let attempt = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await;

        let failure = match attempt {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                self.stream = Some(stream);
                self.emit(DriverSignal::Connected);
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.connect_timeout),
        };

        self.emit(DriverSignal::Error {
            code: TRANSPORT_FAULT,
            message: failure.clone(),
        });
        Err(DaqError::Connection {
            link: LinkKind::Access,
            endpoint: endpoint.to_string(),
            reason: failure,
        })
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone.
            let _ = stream.shutdown().await;
            self.emit(DriverSignal::Disconnected);
        }
        Ok(())
    }

    async fn read_raw(&mut self, count: usize) -> AppResult<Vec<f32>> {
        let quantity = count * 2;
        if count == 0 || quantity > MAX_REGISTERS {
            return Err(DaqError::Protocol {
                link: LinkKind::Access,
                reason: format!("cannot read {} channels in one request", count),
            });
        }

        self.transaction = self.transaction.wrapping_add(1);
        let request = encode_request(self.transaction, self.unit_id, self.start_register, quantity as u16);

        let (header, pdu) = match self.transact(&request).await {
            Ok(frames) => frames,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(DaqError::Protocol {
                    link: LinkKind::Access,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(self.lose_link(&e)),
        };

        match decode_response(self.transaction, self.unit_id, &header, pdu) {
            Ok(values) => {
                debug!(tid = self.transaction, channels = values.len(), "modbus read complete");
                Ok(values)
            }
            Err(ResponseError::Exception(code)) => {
                let message = format!("Modbus exception {:#04x}", code);
                self.emit(DriverSignal::Error {
                    code: i32::from(code),
                    message: message.clone(),
                });
                Err(DaqError::Protocol {
                    link: LinkKind::Access,
                    reason: message,
                })
            }
            Err(ResponseError::Malformed(reason)) => Err(DaqError::Protocol {
                link: LinkKind::Access,
                reason,
            }),
        }
    }

    fn signals(&self) -> broadcast::Receiver<DriverSignal> {
        self.signals.subscribe()
    }
}

/// Throw away bytes left over from an exchange that was abandoned mid-way.
fn discard_stale(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut scratch = [0u8; 256];
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => debug!("discarded {} stale bytes", n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Read Input Registers request frame.
pub fn encode_request(transaction: u16, unit_id: u8, start: u16, quantity: u16) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_LEN + 5);
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16(6);
    frame.put_u8(unit_id);
    frame.put_u8(READ_INPUT_REGISTERS);
    frame.put_u16(start);
    frame.put_u16(quantity);
    frame
}

#[derive(Debug, PartialEq)]
enum ResponseError {
    Exception(u8),
    Malformed(String),
}

fn decode_response(
    transaction: u16,
    unit_id: u8,
    header: &[u8],
    mut pdu: BytesMut,
) -> Result<Vec<f32>, ResponseError> {
    let malformed = |msg: String| Err(ResponseError::Malformed(msg));

    let tid = u16::from_be_bytes([header[0], header[1]]);
    let protocol = u16::from_be_bytes([header[2], header[3]]);
    if tid != transaction {
        return malformed(format!("transaction id {} does not match {}", tid, transaction));
    }
    if protocol != 0 {
        return malformed(format!("protocol id {} is not Modbus", protocol));
    }
    if header[6] != unit_id {
        return malformed(format!("reply from unit {} instead of {}", header[6], unit_id));
    }

    let function = pdu.get_u8();
    if function == READ_INPUT_REGISTERS | EXCEPTION_FLAG {
        return match pdu.first() {
            Some(code) => Err(ResponseError::Exception(*code)),
            None => malformed("exception response without code".into()),
        };
    }
    if function != READ_INPUT_REGISTERS {
        return malformed(format!("unexpected function code {:#04x}", function));
    }
    if !pdu.has_remaining() {
        return malformed("missing byte count".into());
    }
    let byte_count = pdu.get_u8() as usize;
    if byte_count != pdu.remaining() || byte_count % 4 != 0 {
        return malformed(format!(
            "byte count {} does not fit {} data bytes",
            byte_count,
            pdu.remaining()
        ));
    }

    let mut values = Vec::with_capacity(byte_count / 4);
    while pdu.remaining() >= 4 {
        values.push(f32::from_bits(pdu.get_u32()));
    }
    Ok(values)
}

/// Encode a successful response carrying `values`. Used by the emulator.
pub fn encode_response(transaction: u16, unit_id: u8, values: &[f32]) -> BytesMut {
    let data_len = values.len() * 4;
    let mut frame = BytesMut::with_capacity(MBAP_LEN + 2 + data_len);
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16((3 + data_len) as u16);
    frame.put_u8(unit_id);
    frame.put_u8(READ_INPUT_REGISTERS);
    frame.put_u8(data_len as u8);
    for value in values {
        frame.put_u32(value.to_bits());
    }
    frame
}

/// Encode an exception response. Used by the emulator.
pub fn encode_exception(transaction: u16, unit_id: u8, function: u8, code: u8) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_LEN + 2);
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16(3);
    frame.put_u8(unit_id);
    frame.put_u8(function | EXCEPTION_FLAG);
    frame.put_u8(code);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: BytesMut) -> (Vec<u8>, BytesMut) {
        let mut frame = frame;
        let pdu = frame.split_off(MBAP_LEN);
        (frame.to_vec(), pdu)
    }

    #[test]
    fn test_request_layout() {
        let frame = encode_request(0x0102, 7, 16, 30);
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x02, 0, 0, 0, 6, 7, 0x04, 0, 16, 0, 30]
        );
    }

    #[test]
    fn test_decode_values() {
        let (header, pdu) = split(encode_response(9, 1, &[1.5, -2.25, 0.0]));
        let values = decode_response(9, 1, &header, pdu).unwrap();
        assert_eq!(values, vec![1.5, -2.25, 0.0]);
    }

    #[test]
    fn test_decode_exception() {
        let (header, pdu) = split(encode_exception(3, 1, READ_INPUT_REGISTERS, 0x02));
        assert_eq!(
            decode_response(3, 1, &header, pdu),
            Err(ResponseError::Exception(0x02))
        );
    }

    #[test]
    fn test_stale_transaction_rejected() {
        let (header, pdu) = split(encode_response(4, 1, &[1.0]));
        assert!(matches!(
            decode_response(5, 1, &header, pdu),
            Err(ResponseError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let mut frame = encode_response(1, 1, &[1.0, 2.0]);
        frame.truncate(frame.len() - 2);
        let (header, pdu) = split(frame);
        assert!(matches!(
            decode_response(1, 1, &header, pdu),
            Err(ResponseError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_without_connection_signals_loss() {
        let mut driver = ModbusTcpDriver::new(1, 0);
        let mut signals = driver.signals();

        let err = driver.read_raw(2).await.unwrap_err();
        assert!(matches!(err, DaqError::Read { .. }));
        assert!(matches!(signals.try_recv(), Ok(DriverSignal::Error { .. })));
        assert_eq!(signals.try_recv().ok(), Some(DriverSignal::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut driver = ModbusTcpDriver::new(1, 0);
        let err = driver
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert!(!driver.is_connected());
    }
}
