//! Gateway sizing constants and Modbus protocol limits
//!
//! Buffer sizes are fixed at compile time so that every queue, frame and
//! counter table has a bounded footprint.

// ============================================================================
// Request queue
// ============================================================================

/// Max number of TCP or UDP requests stored in the queue
pub const MAX_QUEUE_REQUESTS: usize = 10;

/// Total payload bytes of all requests stored in the queue
pub const MAX_QUEUE_DATA: usize = 256;

// ============================================================================
// Frame sizes
// ============================================================================

/// Max size of a Modbus RTU frame: address(1) + PDU(253) + CRC(2)
pub const MODBUS_SIZE: usize = 256;

/// Max PDU size (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// Max PDU data size (PDU without the function code)
pub const MAX_PDU_DATA: usize = MAX_PDU_SIZE - 1;

/// Minimum RTU frame: address + function code + CRC
pub const MIN_RTU_FRAME: usize = 4;

/// MBAP header length without the unit identifier (transaction, protocol, length)
pub const MBAP_HEADER_LEN: usize = 6;

/// Max MBAP length field value: unit_id(1) + PDU(253)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Max Modbus TCP/UDP ADU size
pub const MAX_ADU_SIZE: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

// ============================================================================
// Addressing
// ============================================================================

/// Broadcast address, no response is sent or expected
pub const BROADCAST_ADDRESS: u8 = 0;

/// Max number of Modbus slaves (the rest is for reserved addresses)
pub const MAX_SLAVES: usize = 247;

/// Highest valid slave address
pub const MAX_SLAVE_ADDRESS: u8 = MAX_SLAVES as u8;

// ============================================================================
// Slave scan
// ============================================================================

/// Function code sent during a scan request (first attempt)
pub const SCAN_FUNCTION_FIRST: u8 = 0x03;

/// Function code sent during a scan request (second attempt)
pub const SCAN_FUNCTION_SECOND: u8 = 0x04;

/// Data address sent during a scan request (both attempts)
pub const SCAN_DATA_ADDRESS: u16 = 0x0001;

/// Timeout (ms) for scan requests
pub const SCAN_TIMEOUT_MS: u16 = 200;

// ============================================================================
// Serial line
// ============================================================================

/// Baud rates (divided by 100) accepted by the gateway
pub const BAUD_RATES: [u16; 11] = [3, 6, 9, 12, 24, 48, 96, 192, 384, 576, 1152];

/// Above this baud rate the t3.5 silent interval is fixed at 1750 us
pub const FIXED_SILENCE_BAUD: u32 = 19_200;

/// Fixed t3.5 silent interval (us) for fast baud rates
pub const FIXED_SILENCE_US: u64 = 1_750;

/// Max length (bytes) of the last response kept for display
pub const MAX_RESPONSE_LEN: usize = 16;

// ============================================================================
// Exception codes
// ============================================================================

pub mod exception {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    pub const SERVER_DEVICE_FAILURE: u8 = 0x04;
    pub const ACKNOWLEDGE: u8 = 0x05;
    pub const SERVER_DEVICE_BUSY: u8 = 0x06;
    pub const MEMORY_PARITY_ERROR: u8 = 0x08;
    pub const GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
    pub const GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND: u8 = 0x0B;

    /// Human-readable exception description
    pub fn description(code: u8) -> &'static str {
        match code {
            ILLEGAL_FUNCTION => "Illegal Function",
            ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
            ILLEGAL_DATA_VALUE => "Illegal Data Value",
            SERVER_DEVICE_FAILURE => "Slave Device Failure",
            ACKNOWLEDGE => "Acknowledge",
            SERVER_DEVICE_BUSY => "Slave Device Busy",
            0x07 => "Negative Acknowledge",
            MEMORY_PARITY_ERROR => "Memory Parity Error",
            GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
            GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
    }
}
