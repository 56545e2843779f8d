use log::info;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BAUD_RATE: u32 = 2400;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("no data within {0:?}")]
    Timeout(Duration),
}

/// A half-duplex byte channel towards the inverter.
///
/// The driver is the only caller and never overlaps a write with a pending
/// read, implementations need no internal synchronisation.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns whatever arrived within `timeout`, at most `max_bytes` and
    /// never empty. No data at all is reported as [`TransportError::Timeout`].
    fn read_with_timeout(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Drops stale input, e.g. the tail of an answer that arrived too late.
    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// PI18 inverters talk 8N1 on their RS232/USB port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)?;
        info!("serial port {path} opened at {baud_rate} baud");
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        let mut buf = vec![0u8; max_bytes];
        match self.port.read(&mut buf) {
            Ok(0) => Err(TransportError::Timeout(timeout)),
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TransportError::Timeout(timeout)),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)?;
        Ok(())
    }
}
