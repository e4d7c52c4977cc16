//! RS-485 serial port
//!
//! The gateway core drives the bus through [`ChannelSerialLine`], which only
//! queues commands. A dedicated task owns the `tokio-serial` stream, applies
//! the commands in order (RTS for direction control, then the bytes) and
//! forwards everything it reads, stamped with the monotonic clock.

use std::io;

use bytes::Bytes;
use rtu_gateway::constants::MODBUS_SIZE;
use rtu_gateway::{Parity, SerialConfig, SerialLine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::{DataBits, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{GatewaySrvError, Result};
use crate::runtime::MonotonicClock;

/// Command for the serial task, applied in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    TransmitEnable(bool),
    Write(Bytes),
}

/// Bytes read from the bus
#[derive(Debug, Clone)]
pub struct SerialRx {
    pub bytes: Bytes,
    /// Monotonic arrival time (ms)
    pub at_ms: u64,
}

/// `SerialLine` that hands commands to the serial task without blocking
#[derive(Debug, Clone)]
pub struct ChannelSerialLine {
    commands: mpsc::UnboundedSender<SerialCommand>,
}

impl ChannelSerialLine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SerialCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }
}

impl SerialLine for ChannelSerialLine {
    fn set_transmit_enable(&mut self, enabled: bool) {
        if self.commands.send(SerialCommand::TransmitEnable(enabled)).is_err() {
            warn!("Serial task gone, TX enable {} dropped", enabled);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.commands
            .send(SerialCommand::Write(Bytes::copy_from_slice(bytes)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "serial task stopped"))
    }
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(GatewaySrvError::SerialError(format!(
            "Unsupported data bits: {}",
            other
        ))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(GatewaySrvError::SerialError(format!(
            "Unsupported stop bits: {}",
            other
        ))),
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

/// Open the configured port with transmit-enable released
pub fn open_port(config: &SerialConfig) -> Result<SerialStream> {
    let mut port = tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(data_bits(config.format.data_bits)?)
        .parity(parity(config.format.parity))
        .stop_bits(stop_bits(config.format.stop_bits)?)
        .open_native_async()
        .map_err(|e| {
            GatewaySrvError::SerialError(format!("Failed to open {}: {}", config.device, e))
        })?;

    if let Err(e) = port.write_request_to_send(false) {
        warn!("RTS reset failed on {}: {}", config.device, e);
    }
    debug!(
        "Serial open: {} @ {} {}",
        config.device, config.baud_rate, config.format
    );
    Ok(port)
}

/// Own the port until cancelled or the command channel closes
pub async fn run_serial_task(
    mut port: SerialStream,
    mut commands: mpsc::UnboundedReceiver<SerialCommand>,
    rx_tx: mpsc::Sender<SerialRx>,
    clock: MonotonicClock,
    token: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; MODBUS_SIZE];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    SerialCommand::TransmitEnable(enabled) => {
                        trace!("RTS {}", enabled);
                        if let Err(e) = port.write_request_to_send(enabled) {
                            warn!("RTS set failed: {}", e);
                        }
                    },
                    SerialCommand::Write(bytes) => {
                        port.write_all(&bytes).await?;
                        port.flush().await?;
                    },
                }
            },
            read = port.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        error!("Serial port closed");
                        return Err(GatewaySrvError::SerialError("port closed".to_string()));
                    },
                    Ok(n) => n,
                    Err(e) => {
                        error!("Serial read failed: {}", e);
                        return Err(e.into());
                    },
                };
                let rx = SerialRx {
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                    at_ms: clock.now_ms(),
                };
                trace!("Serial RX: {}B", n);
                if rx_tx.send(rx).await.is_err() {
                    break;
                }
            },
        }
    }

    debug!("Serial task stopped");
    Ok(())
}
