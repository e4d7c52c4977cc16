//! Gateway configuration types
//!
//! `GatewayConfig` is the full serde-loadable configuration; `EngineConfig`
//! is the read-only subset the transaction engine works from, with serial
//! timing precomputed from baud rate and character format.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{BAUD_RATES, FIXED_SILENCE_BAUD, FIXED_SILENCE_US, SCAN_TIMEOUT_MS};
use crate::error::{GatewayError, Result};

// ============================================================================
// Serial character format
// ============================================================================

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial character format, written as `"8E1"` (data bits, parity, stop bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialFormat {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialFormat {
    pub const fn new(data_bits: u8, parity: Parity, stop_bits: u8) -> Self {
        Self {
            data_bits,
            parity,
            stop_bits,
        }
    }

    /// Bits on the wire per character: start + data + parity + stop
    pub fn bits_per_char(&self) -> u32 {
        let parity = match self.parity {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        };
        1 + u32::from(self.data_bits) + parity + u32::from(self.stop_bits)
    }
}

impl Default for SerialFormat {
    fn default() -> Self {
        Self::new(8, Parity::Even, 1)
    }
}

impl fmt::Display for SerialFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{}{}{}", self.data_bits, parity, self.stop_bits)
    }
}

impl FromStr for SerialFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.trim().as_bytes();
        if bytes.len() != 3 {
            return Err(GatewayError::config(format!(
                "Invalid serial format '{s}', expected e.g. 8E1"
            )));
        }

        let data_bits = match bytes[0] {
            b'7' => 7,
            b'8' => 8,
            other => {
                return Err(GatewayError::config(format!(
                    "Invalid data bits '{}' in '{s}'",
                    other as char
                )))
            },
        };
        let parity = match bytes[1].to_ascii_uppercase() {
            b'N' => Parity::None,
            b'E' => Parity::Even,
            b'O' => Parity::Odd,
            other => {
                return Err(GatewayError::config(format!(
                    "Invalid parity '{}' in '{s}'",
                    other as char
                )))
            },
        };
        let stop_bits = match bytes[2] {
            b'1' => 1,
            b'2' => 2,
            other => {
                return Err(GatewayError::config(format!(
                    "Invalid stop bits '{}' in '{s}'",
                    other as char
                )))
            },
        };

        Ok(Self::new(data_bits, parity, stop_bits))
    }
}

impl TryFrom<String> for SerialFormat {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SerialFormat> for String {
    fn from(format: SerialFormat) -> Self {
        format.to_string()
    }
}

// ============================================================================
// Gateway configuration
// ============================================================================

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (e.g. /dev/ttyUSB0)
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub format: SerialFormat,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            format: SerialFormat::default(),
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub serial: SerialConfig,

    /// Delay (ms) after the last transmitted byte before releasing transmit-enable
    #[serde(default = "default_inter_frame_delay_ms")]
    pub inter_frame_delay_ms: u16,

    /// Per-attempt response timeout (ms)
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u16,

    /// Transmissions per request, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u8,

    /// Carry raw RTU frames over TCP/UDP instead of MBAP ADUs
    #[serde(default)]
    pub rtu_over_tcp: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub tcp_port: u16,

    #[serde(default = "default_port")]
    pub udp_port: u16,

    /// Floor (ms) on the end-of-frame silence, for hosts that see serial
    /// bytes in late bursts (USB adapters). 0 uses t3.5 alone.
    #[serde(default)]
    pub min_silence_ms: u16,

    /// Close TCP sessions idle this long (seconds, 0 = never)
    #[serde(default = "default_tcp_idle_timeout_s")]
    pub tcp_idle_timeout_s: u64,

    /// Forget UDP peers silent this long (seconds, 0 = never)
    #[serde(default = "default_udp_idle_timeout_s")]
    pub udp_idle_timeout_s: u64,

    /// Statistics snapshot file, no persistence when absent
    #[serde(default)]
    pub stats_file: Option<PathBuf>,

    #[serde(default = "default_stats_flush_interval_h")]
    pub stats_flush_interval_h: u64,

    /// Directory for rolling log files, console only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

// Default value functions for serde
fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_inter_frame_delay_ms() -> u16 {
    150
}
fn default_response_timeout_ms() -> u16 {
    500
}
fn default_attempts() -> u8 {
    3
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    502
}
fn default_tcp_idle_timeout_s() -> u64 {
    600
}
fn default_udp_idle_timeout_s() -> u64 {
    600
}
fn default_stats_flush_interval_h() -> u64 {
    6
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            inter_frame_delay_ms: default_inter_frame_delay_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            attempts: default_attempts(),
            rtu_over_tcp: false,
            bind_address: default_bind_address(),
            tcp_port: default_port(),
            udp_port: default_port(),
            min_silence_ms: 0,
            tcp_idle_timeout_s: default_tcp_idle_timeout_s(),
            udp_idle_timeout_s: default_udp_idle_timeout_s(),
            stats_file: None,
            stats_flush_interval_h: default_stats_flush_interval_h(),
            log_dir: None,
        }
    }
}

impl GatewayConfig {
    /// Check values against the supported ranges
    pub fn validate(&self) -> Result<()> {
        validate_baud_rate(self.serial.baud_rate)?;
        if self.serial.device.trim().is_empty() {
            return Err(GatewayError::config("Serial device must not be empty"));
        }
        if self.attempts == 0 {
            return Err(GatewayError::config("attempts must be at least 1"));
        }
        if self.response_timeout_ms == 0 {
            return Err(GatewayError::config("response_timeout_ms must be > 0"));
        }
        if self.stats_flush_interval_h == 0 {
            return Err(GatewayError::config("stats_flush_interval_h must be > 0"));
        }
        if self.tcp_port == 0 || self.udp_port == 0 {
            return Err(GatewayError::config("Listener ports must be non-zero"));
        }
        Ok(())
    }
}

/// Accept only the standard rates of the baud table
pub fn validate_baud_rate(baud_rate: u32) -> Result<()> {
    let listed = baud_rate % 100 == 0
        && BAUD_RATES
            .iter()
            .any(|&rate| u32::from(rate) * 100 == baud_rate);
    if listed {
        Ok(())
    } else {
        Err(GatewayError::config(format!(
            "Unsupported baud rate {baud_rate}"
        )))
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Serial timing and retry policy used by the transaction engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub baud_rate: u32,
    pub format: SerialFormat,
    pub inter_frame_delay_ms: u16,
    pub response_timeout_ms: u16,
    pub attempts: u8,
    pub scan_timeout_ms: u16,
    /// Host-side floor on the end-of-frame silence (ms)
    pub min_silence_ms: u16,
}

impl EngineConfig {
    /// Duration of one character on the wire (us, rounded up)
    pub fn char_time_us(&self) -> u64 {
        let bits = u64::from(self.format.bits_per_char());
        (bits * 1_000_000).div_ceil(u64::from(self.baud_rate.max(1)))
    }

    /// t3.5 silent interval (us)
    pub fn silent_interval_us(&self) -> u64 {
        if self.baud_rate > FIXED_SILENCE_BAUD {
            FIXED_SILENCE_US
        } else {
            let bits = u64::from(self.format.bits_per_char());
            (bits * 3_500_000).div_ceil(u64::from(self.baud_rate.max(1)))
        }
    }

    /// t3.5 silent interval rounded up to whole milliseconds
    pub fn silent_interval_ms(&self) -> u64 {
        self.silent_interval_us().div_ceil(1_000)
    }

    /// Receive silence that closes a frame: t3.5, raised to the host floor
    pub fn end_of_frame_ms(&self) -> u64 {
        self.silent_interval_ms().max(u64::from(self.min_silence_ms))
    }

    /// Effective inter-frame delay, never shorter than t3.5
    pub fn frame_delay_ms(&self) -> u64 {
        u64::from(self.inter_frame_delay_ms).max(self.silent_interval_ms())
    }

    /// Time to shift `len` bytes out of the UART (ms, rounded up)
    pub fn transmit_time_ms(&self, len: usize) -> u64 {
        let bits = len as u64 * u64::from(self.format.bits_per_char());
        (bits * 1_000).div_ceil(u64::from(self.baud_rate.max(1)))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for EngineConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            baud_rate: config.serial.baud_rate,
            format: config.serial.format,
            inter_frame_delay_ms: config.inter_frame_delay_ms,
            response_timeout_ms: config.response_timeout_ms,
            attempts: config.attempts.max(1),
            scan_timeout_ms: SCAN_TIMEOUT_MS,
            min_silence_ms: config.min_silence_ms,
        }
    }
}
