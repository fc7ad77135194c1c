use std::{fmt, io, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_modbus::client::{rtu, Context as ModbusClient};
use tokio_modbus::prelude::*;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilder, SerialStream};
use tracing::{debug, info, warn};

use super::{definition::SerialSettings, RegisterReader, UnitId};

/// Per-read behaviour of the serial link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkOptions {
    /// How long to wait for a single response.
    pub timeout: Duration,
    /// How many times a request that timed out is sent again.
    pub retries: u8,
}

/// A byte stream carrying RTU frames, normally a serial port.
pub trait Transport: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static {}

/// Opens a fresh transport with nothing left buffered from earlier requests.
pub type Opener = Box<dyn FnMut() -> io::Result<Box<dyn Transport>> + Send>;

/// A Modbus RTU master on one serial port.
///
/// RTU has no transaction ids, so a reply that arrives after its request timed out would be taken for the answer to
/// the next request. After a timeout or a failed frame the transport is therefore dropped, and reopened with an empty
/// input buffer before the next request.
pub struct RtuReader {
    port: String,
    open: Opener,
    client: Option<ModbusClient>,
    options: LinkOptions,
}

impl fmt::Debug for RtuReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuReader")
            .field("port", &self.port)
            .field("connected", &self.client.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Open `port` with the given line settings.
///
/// The port is an explicit argument rather than something read out of the settings, so probing candidate ports
/// never changes what the rest of the program thinks the meter port is.
pub async fn connect(
    port: &str,
    serial: &SerialSettings,
    options: LinkOptions,
    unit: UnitId,
) -> crate::Result<RtuReader> {
    info!(
        port,
        baud_rate = serial.baudrate,
        bytesize = serial.bytesize,
        parity = %serial.parity,
        stopbits = serial.stopbits,
        "Connecting to energy meter"
    );

    let builder = tokio_serial::new(port, serial.baudrate)
        .data_bits(serial.data_bits()?)
        .parity(serial.parity()?)
        .stop_bits(serial.stop_bits()?)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(options.timeout);

    // Opened here so that a missing port is reported right away.
    let mut first = Some(open_serial(&builder)?);
    let open: Opener = Box::new(move || -> io::Result<Box<dyn Transport>> {
        let stream = match first.take() {
            Some(stream) => stream,
            None => open_serial(&builder).map_err(io::Error::from)?,
        };
        Ok(Box::new(stream) as Box<dyn Transport>)
    });

    let mut reader = RtuReader::new(port, open, options);
    reader.client(unit).await?;
    Ok(reader)
}

fn open_serial(builder: &SerialPortBuilder) -> tokio_serial::Result<SerialStream> {
    let stream = SerialStream::open(builder)?;
    stream.clear(ClearBuffer::Input)?;
    Ok(stream)
}

impl RtuReader {
    /// A reader that opens its transport on the first request.
    pub fn new(port: impl Into<String>, open: Opener, options: LinkOptions) -> Self {
        Self {
            port: port.into(),
            open,
            client: None,
            options,
        }
    }

    async fn client(&mut self, unit: UnitId) -> io::Result<&mut ModbusClient> {
        let client = match self.client.take() {
            Some(client) => client,
            None => {
                debug!(port = %self.port, "Opening transport");
                let transport = (self.open)()?;
                rtu::connect_slave(transport, Slave(unit)).await?
            }
        };

        let client = self.client.insert(client);
        client.set_slave(Slave(unit));
        Ok(client)
    }

    /// Forget the transport after a timeout, and let the late reply (if any) arrive while nobody listens.
    async fn discard_in_flight(&mut self) {
        self.client = None;
        tokio::time::sleep(self.options.timeout).await;
    }
}

#[async_trait::async_trait]
impl RegisterReader for RtuReader {
    async fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> io::Result<Vec<u16>> {
        let timeout = self.options.timeout;

        let mut attempt: u8 = 0;
        loop {
            let client = self.client(unit).await?;
            let request = client.read_holding_registers(address, count);
            let response = tokio::time::timeout(timeout, request).await;
            match response {
                Ok(Ok(words)) => return Ok(words),
                Ok(Err(error)) => {
                    // Whatever is left of a broken frame must not prefix the next reply.
                    self.client = None;
                    return Err(error);
                }
                Err(_) => {
                    self.discard_in_flight().await;
                    if attempt >= self.options.retries {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "no response after {} attempts",
                                u16::from(self.options.retries) + 1
                            ),
                        ));
                    }

                    attempt += 1;
                    warn!(
                        port = %self.port,
                        address,
                        count,
                        unit,
                        attempt,
                        "No response, retrying"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn crc16(frame: &[u8]) -> u16 {
        let mut crc = 0xFFFF_u16;
        for byte in frame {
            crc ^= u16::from(*byte);
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xA001
                } else {
                    crc >> 1
                };
            }
        }
        crc
    }

    /// A slave answering every register with its own address, `delay` late for register `slow`.
    async fn slave(mut stream: DuplexStream, slow: u16, delay: Duration) {
        let mut request = [0u8; 8];
        while stream.read_exact(&mut request).await.is_ok() {
            let address = u16::from_be_bytes([request[2], request[3]]);
            let count = u16::from_be_bytes([request[4], request[5]]);
            if address == slow {
                tokio::time::sleep(delay).await;
            }

            let mut response = vec![request[0], request[1], (count * 2) as u8];
            for register in address..address + count {
                response.extend_from_slice(&register.to_be_bytes());
            }
            let crc = crc16(&response);
            response.extend_from_slice(&crc.to_le_bytes());

            if stream.write_all(&response).await.is_err() {
                break;
            }
        }
    }

    fn duplex_reader(slow: u16, retries: u8, opened: Arc<AtomicUsize>) -> RtuReader {
        let open: Opener = Box::new(move || -> io::Result<Box<dyn Transport>> {
            opened.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(256);
            tokio::spawn(slave(server, slow, Duration::from_millis(150)));
            Ok(Box::new(client) as Box<dyn Transport>)
        });
        let options = LinkOptions {
            timeout: Duration::from_millis(100),
            retries,
        };
        RtuReader::new("duplex", open, options)
    }

    #[tokio::test]
    async fn reads_through_one_transport() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mut reader = duplex_reader(0xFFFF, 0, opened.clone());

        assert_eq!(reader.read_holding_registers(1, 0x1C, 2).await.unwrap(), vec![0x1C, 0x1D]);
        assert_eq!(reader.read_holding_registers(1, 0x23, 1).await.unwrap(), vec![0x23]);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_reply_does_not_answer_the_next_read() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mut reader = duplex_reader(0x23, 0, opened.clone());

        let error = reader.read_holding_registers(1, 0x23, 1).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);

        assert_eq!(reader.read_holding_registers(1, 0x24, 1).await.unwrap(), vec![0x24]);
        assert_eq!(reader.read_holding_registers(1, 0x25, 1).await.unwrap(), vec![0x25]);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn every_retry_starts_on_a_fresh_transport() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mut reader = duplex_reader(0x23, 2, opened.clone());

        let error = reader.read_holding_registers(1, 0x23, 1).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert_eq!(error.to_string(), "no response after 3 attempts");
        assert_eq!(opened.load(Ordering::SeqCst), 3);

        assert_eq!(reader.read_holding_registers(1, 0x24, 1).await.unwrap(), vec![0x24]);
        assert_eq!(opened.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn connect_to_missing_port_fails() {
        let serial = SerialSettings {
            baudrate: 9600,
            bytesize: 8,
            parity: "N".to_owned(),
            stopbits: 1,
        };
        let options = LinkOptions {
            timeout: Duration::from_millis(100),
            retries: 0,
        };

        let result = connect("/dev/energymeter2mqtt-missing", &serial, options, 1).await;
        assert!(matches!(result, Err(crate::Error::SerialError(_))));
    }

    #[tokio::test]
    async fn connect_rejects_bad_line_settings() {
        let serial = SerialSettings {
            baudrate: 9600,
            bytesize: 9,
            parity: "N".to_owned(),
            stopbits: 1,
        };
        let options = LinkOptions {
            timeout: Duration::from_millis(100),
            retries: 0,
        };

        let result = connect("/dev/energymeter2mqtt-missing", &serial, options, 1).await;
        assert!(matches!(
            result,
            Err(crate::Error::InvalidSerialSetting {
                setting: "bytesize",
                ..
            })
        ));
    }
}
