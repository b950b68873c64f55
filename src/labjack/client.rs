use log::{debug, info, warn};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::interface::DaqInterface;
use super::protocol::{DEFAULT_UNIT_ID, MAX_WRITE_WORDS, Protocol};
use super::registers::{self, Register};
use crate::error::GalvoError;

/// Port the T7 serves Modbus TCP on
pub const MODBUS_PORT: u16 = 502;

/// Timeouts for the Modbus TCP connection to the T7
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Builder for [`LabJackClient`]
///
/// ```no_run
/// use std::time::Duration;
/// use galvo_scan::LabJackClient;
///
/// let client = LabJackClient::builder()
///     .address("192.168.1.207")
///     .connect_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct LabJackClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    config: ConnectionConfig,
}

impl LabJackClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<LabJackClient, GalvoError> {
        let address = self
            .address
            .ok_or_else(|| GalvoError::InvalidAddress("address must be specified".to_string()))?;
        let port = self.port.unwrap_or(MODBUS_PORT);

        let socket_addr: SocketAddr = (address.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| GalvoError::InvalidAddress(address.clone()))?
            .next()
            .ok_or_else(|| GalvoError::InvalidAddress(address.clone()))?;

        debug!("Connecting to T7 at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    GalvoError::Timeout
                } else {
                    GalvoError::Io {
                        source: e,
                        context: format!("Failed to connect to {socket_addr}"),
                    }
                }
            })?;

        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        info!("Opened T7 at {socket_addr}");

        Ok(LabJackClient {
            stream: Some(stream),
            peer: socket_addr,
            unit_id: self.unit_id.unwrap_or(DEFAULT_UNIT_ID),
            transaction_id: 0,
        })
    }
}

/// LabJack T7 reached over Modbus TCP
///
/// Registers are addressed by name; see [`registers::lookup`] for the
/// supported families.
pub struct LabJackClient {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    unit_id: u8,
    transaction_id: u16,
}

impl LabJackClient {
    /// Open the device at `identifier`, given as `host` or `host:port`
    pub fn open(identifier: &str) -> Result<Self, GalvoError> {
        match identifier.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| GalvoError::InvalidAddress(identifier.to_string()))?;
                Self::builder().address(host).port(port).build()
            }
            None => Self::builder().address(identifier).build(),
        }
    }

    pub fn builder() -> LabJackClientBuilder {
        LabJackClientBuilder::default()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Send one request frame and return the response PDU
    fn transact(&mut self, frame: Vec<u8>, transaction_id: u16) -> Result<Vec<u8>, GalvoError> {
        let stream = self.stream.as_mut().ok_or(GalvoError::DeviceClosed)?;

        stream.write_all(&frame).map_err(|e| GalvoError::Io {
            source: e,
            context: "Failed to send Modbus request".to_string(),
        })?;

        let header = Protocol::read_header(&mut *stream)?;
        let mut pdu = vec![0u8; header.pdu_len()];
        stream.read_exact(&mut pdu).map_err(|e| GalvoError::Io {
            source: e,
            context: "Failed to read Modbus response body".to_string(),
        })?;

        if header.transaction_id != transaction_id {
            return Err(GalvoError::Protocol(format!(
                "response for transaction {} while waiting for {}",
                header.transaction_id, transaction_id
            )));
        }
        Ok(pdu)
    }

    fn write_words(&mut self, start: u16, words: &[u16]) -> Result<(), GalvoError> {
        let transaction_id = self.next_transaction();
        let frame = Protocol::encode_write_registers(transaction_id, self.unit_id, start, words)?;
        let pdu = self.transact(frame, transaction_id)?;
        Protocol::check_write_response(&pdu, start, words.len() as u16)
    }

    fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>, GalvoError> {
        let transaction_id = self.next_transaction();
        let frame = Protocol::encode_read_registers(transaction_id, self.unit_id, start, count)?;
        let pdu = self.transact(frame, transaction_id)?;
        Protocol::decode_read_response(&pdu, count)
    }
}

/// Group writes whose registers are adjacent so each group goes out as one frame
fn contiguous_runs(
    writes: &[(&str, f64)],
) -> Result<Vec<(u16, Vec<u16>)>, GalvoError> {
    let mut runs: Vec<(u16, Vec<u16>)> = Vec::new();
    let mut next_address: Option<u16> = None;

    for (channel, value) in writes {
        let Register { address, kind } = registers::lookup(channel)?;
        let words = Protocol::value_to_words(*value, kind)?;

        match runs.last_mut() {
            Some((_, run))
                if next_address == Some(address)
                    && run.len() + words.len() <= MAX_WRITE_WORDS as usize =>
            {
                run.extend_from_slice(&words);
            }
            _ => runs.push((address, words)),
        }
        next_address = Some(address + kind.words());
    }
    Ok(runs)
}

impl DaqInterface for LabJackClient {
    fn write_name(&mut self, channel: &str, value: f64) -> Result<(), GalvoError> {
        let register = registers::lookup(channel)?;
        let words = Protocol::value_to_words(value, register.kind)?;
        self.write_words(register.address, &words)
    }

    fn write_names(&mut self, writes: &[(&str, f64)]) -> Result<(), GalvoError> {
        for (start, words) in contiguous_runs(writes)? {
            self.write_words(start, &words)?;
        }
        Ok(())
    }

    fn read_name(&mut self, channel: &str) -> Result<f64, GalvoError> {
        let register = registers::lookup(channel)?;
        let words = self.read_words(register.address, register.kind.words())?;
        Protocol::words_to_value(&words, register.kind)
    }

    fn close(&mut self) -> Result<(), GalvoError> {
        let stream = self.stream.take().ok_or(GalvoError::DeviceClosed)?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => {
                info!("Closed T7 at {}", self.peer);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(GalvoError::Release(format!("T7 at {}: {e}", self.peer))),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
