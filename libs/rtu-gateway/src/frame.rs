//! Modbus frame codec
//!
//! Parses and serializes Modbus RTU frames (address + PDU + CRC-16) and
//! Modbus TCP/UDP ADUs (MBAP header + PDU). Frames live in fixed-size stack
//! buffers; encoding writes into a caller-owned slice and never allocates.

use std::fmt;

use crc::{Crc, CRC_16_MODBUS};
use tracing::trace;

use crate::constants::{
    MAX_ADU_SIZE, MAX_PDU_DATA, MAX_SLAVE_ADDRESS, MBAP_HEADER_LEN, MIN_RTU_FRAME, MODBUS_SIZE,
};
use crate::error::CodecError;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Calculate CRC16 checksum (Modbus RTU standard)
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Reject function code 0 and a bare exception bit
#[inline]
fn check_function(function: u8) -> Result<(), CodecError> {
    if function & 0x7F == 0 {
        return Err(CodecError::InvalidFunction(function));
    }
    Ok(())
}

/// Reject unit identifiers outside 0-247
#[inline]
pub fn check_unit_id(unit_id: u8) -> Result<(), CodecError> {
    if unit_id > MAX_SLAVE_ADDRESS {
        return Err(CodecError::InvalidUnitId(unit_id));
    }
    Ok(())
}

// ============================================================================
// RTU frame
// ============================================================================

/// Modbus frame contents independent of transport framing
///
/// For RTU traffic `address` is the slave address; for TCP/UDP traffic it
/// carries the MBAP unit identifier.
#[derive(Clone)]
pub struct RtuFrame {
    address: u8,
    function: u8,
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_DATA],
    /// Actual data length
    len: usize,
}

impl RtuFrame {
    /// Create a frame from address, function code and PDU data
    pub fn new(address: u8, function: u8, data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_PDU_DATA {
            return Err(CodecError::FrameTooLarge {
                len: data.len() + MIN_RTU_FRAME,
                max: MODBUS_SIZE,
            });
        }
        check_function(function)?;
        Ok(Self::from_parts(address, function, data))
    }

    /// Rebuild a frame from parts that were validated when first constructed
    pub(crate) fn from_parts(address: u8, function: u8, data: &[u8]) -> Self {
        let mut frame = Self {
            address,
            function,
            data: [0; MAX_PDU_DATA],
            len: data.len(),
        };
        frame.data[..data.len()].copy_from_slice(data);
        frame
    }

    /// Build an exception response for `function`
    pub fn exception(address: u8, function: u8, code: u8) -> Self {
        let mut data = [0; MAX_PDU_DATA];
        data[0] = code;
        Self {
            address,
            function: function | 0x80,
            data,
            len: 1,
        }
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }

    /// PDU data after the function code
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// PDU length (function code + data)
    #[inline]
    pub fn pdu_len(&self) -> usize {
        1 + self.len
    }

    /// Length of the encoded RTU frame
    #[inline]
    pub fn rtu_len(&self) -> usize {
        1 + self.pdu_len() + 2
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.address == crate::constants::BROADCAST_ADDRESS
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Write function code and data into `out`, returning the PDU length
    fn write_pdu(&self, out: &mut [u8]) -> usize {
        out[0] = self.function;
        out[1..1 + self.len].copy_from_slice(self.data());
        self.pdu_len()
    }
}

impl PartialEq for RtuFrame {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.function == other.function
            && self.data() == other.data()
    }
}

impl Eq for RtuFrame {}

impl fmt::Debug for RtuFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuFrame")
            .field("address", &self.address)
            .field("function", &format_args!("0x{:02X}", self.function))
            .field("data", &format_args!("{:02X?}", self.data()))
            .finish()
    }
}

/// Parse an RTU frame (address + PDU + CRC, CRC low byte first)
pub fn decode_rtu_frame(bytes: &[u8]) -> Result<RtuFrame, CodecError> {
    if bytes.len() > MODBUS_SIZE {
        return Err(CodecError::FrameTooLarge {
            len: bytes.len(),
            max: MODBUS_SIZE,
        });
    }
    if bytes.len() < MIN_RTU_FRAME {
        return Err(CodecError::Truncated);
    }

    let frame_len = bytes.len();
    let received = u16::from_le_bytes([bytes[frame_len - 2], bytes[frame_len - 1]]);
    let expected = crc16(&bytes[..frame_len - 2]);
    if received != expected {
        return Err(CodecError::CrcMismatch { expected, received });
    }

    let frame = RtuFrame::new(bytes[0], bytes[1], &bytes[2..frame_len - 2])?;
    trace!(
        "RTU frame: unit_id={}, FC={:02X}, PDU_len={}",
        frame.address,
        frame.function,
        frame.pdu_len()
    );
    Ok(frame)
}

/// Serialize an RTU frame into `out`, returning the number of bytes written
pub fn encode_rtu_frame(frame: &RtuFrame, out: &mut [u8]) -> Result<usize, CodecError> {
    let total = frame.rtu_len();
    if total > out.len() {
        return Err(CodecError::FrameTooLarge {
            len: total,
            max: out.len(),
        });
    }

    out[0] = frame.address;
    let pdu_len = frame.write_pdu(&mut out[1..]);
    let crc = crc16(&out[..1 + pdu_len]);
    out[1 + pdu_len..total].copy_from_slice(&crc.to_le_bytes());
    Ok(total)
}

// ============================================================================
// TCP/UDP ADU
// ============================================================================

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Length field (unit_id + PDU)
    pub length: u16,
    /// Unit identifier (slave ID)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Read the header fields without validating them
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < MBAP_HEADER_LEN + 1 {
            return Err(CodecError::Truncated);
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// Modbus TCP/UDP application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Client transaction identifier, echoed in the response
    pub transaction_id: u16,
    /// Unit identifier and PDU
    pub frame: RtuFrame,
}

/// Parse a Modbus TCP/UDP ADU
pub fn decode_adu(bytes: &[u8]) -> Result<Adu, CodecError> {
    if bytes.len() > MAX_ADU_SIZE {
        return Err(CodecError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_ADU_SIZE,
        });
    }
    // MBAP header + unit_id + function code
    if bytes.len() < MBAP_HEADER_LEN + 2 {
        return Err(CodecError::Truncated);
    }

    let header = MbapHeader::parse(bytes)?;
    if header.protocol_id != 0 {
        return Err(CodecError::InvalidProtocolId(header.protocol_id));
    }

    let actual = bytes.len() - MBAP_HEADER_LEN;
    if usize::from(header.length) != actual {
        return Err(CodecError::LengthMismatch {
            declared: usize::from(header.length),
            actual,
        });
    }
    check_unit_id(header.unit_id)?;

    let frame = RtuFrame::new(
        header.unit_id,
        bytes[MBAP_HEADER_LEN + 1],
        &bytes[MBAP_HEADER_LEN + 2..],
    )?;
    trace!(
        "MBAP header: trans_id={:04X}, length={}, unit_id={}",
        header.transaction_id,
        header.length,
        header.unit_id
    );
    Ok(Adu {
        transaction_id: header.transaction_id,
        frame,
    })
}

/// Serialize an ADU into `out`, returning the number of bytes written
pub fn encode_adu(adu: &Adu, out: &mut [u8]) -> Result<usize, CodecError> {
    let length = 1 + adu.frame.pdu_len();
    let total = MBAP_HEADER_LEN + length;
    if total > out.len() {
        return Err(CodecError::FrameTooLarge {
            len: total,
            max: out.len(),
        });
    }

    out[0..2].copy_from_slice(&adu.transaction_id.to_be_bytes());
    out[2..4].copy_from_slice(&0u16.to_be_bytes());
    out[4..6].copy_from_slice(&(length as u16).to_be_bytes());
    out[6] = adu.frame.address;
    adu.frame.write_pdu(&mut out[MBAP_HEADER_LEN + 1..]);
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn read_holding() -> RtuFrame {
        RtuFrame::new(1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap()
    }

    // ========================================================================
    // CRC Tests
    // ========================================================================

    #[test]
    fn test_crc16_calculation() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    // ========================================================================
    // RTU Tests
    // ========================================================================

    #[test]
    fn test_rtu_encode_appends_crc_low_byte_first() {
        let mut buf = [0u8; MODBUS_SIZE];
        let len = encode_rtu_frame(&read_holding(), &mut buf).unwrap();
        assert_eq!(
            &buf[..len],
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn test_rtu_round_trip() {
        let frames = [
            read_holding(),
            RtuFrame::new(247, 0x10, &[0x00, 0x10, 0x00, 0x01, 0x02, 0xAB, 0xCD]).unwrap(),
            RtuFrame::new(5, 0x11, &[]).unwrap(),
            RtuFrame::new(9, 0x17, &[0x5A; MAX_PDU_DATA]).unwrap(),
            RtuFrame::exception(3, 0x04, 0x02),
        ];

        let mut buf = [0u8; MODBUS_SIZE];
        for frame in frames {
            let len = encode_rtu_frame(&frame, &mut buf).unwrap();
            assert_eq!(decode_rtu_frame(&buf[..len]).unwrap(), frame);
        }
    }

    #[test]
    fn test_rtu_round_trip_every_length() {
        let mut data = [0u8; MAX_PDU_DATA];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31) ^ 0xA5;
        }

        let mut buf = [0u8; MODBUS_SIZE];
        for address in [0, 1, 17, 247] {
            for function in [0x01, 0x03, 0x10, 0x2B, 0x7F, 0x83] {
                for len in 0..=MAX_PDU_DATA {
                    let frame = RtuFrame::new(address, function, &data[..len]).unwrap();
                    let written = encode_rtu_frame(&frame, &mut buf).unwrap();
                    assert_eq!(written, len + MIN_RTU_FRAME);
                    assert_eq!(decode_rtu_frame(&buf[..written]).unwrap(), frame);
                }
            }
        }
    }

    #[test]
    fn test_rtu_crc_bit_flip_rejected() {
        let mut buf = [0u8; MODBUS_SIZE];
        let len = encode_rtu_frame(&read_holding(), &mut buf).unwrap();

        for bit in 0..16 {
            let mut corrupted = buf;
            corrupted[len - 2 + bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(
                decode_rtu_frame(&corrupted[..len]),
                Err(CodecError::CrcMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_rtu_payload_bit_flip_rejected() {
        let mut buf = [0u8; MODBUS_SIZE];
        let len = encode_rtu_frame(&read_holding(), &mut buf).unwrap();
        buf[3] ^= 0x10;
        assert!(matches!(
            decode_rtu_frame(&buf[..len]),
            Err(CodecError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_rtu_truncated() {
        assert_eq!(
            decode_rtu_frame(&[0x01, 0x03, 0xAB]),
            Err(CodecError::Truncated)
        );
        assert_eq!(decode_rtu_frame(&[]), Err(CodecError::Truncated));
    }

    #[test]
    fn test_rtu_too_large() {
        let bytes = [0u8; MODBUS_SIZE + 1];
        assert_eq!(
            decode_rtu_frame(&bytes),
            Err(CodecError::FrameTooLarge {
                len: MODBUS_SIZE + 1,
                max: MODBUS_SIZE
            })
        );
        assert!(matches!(
            RtuFrame::new(1, 0x10, &[0u8; MAX_PDU_DATA + 1]),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_rtu_invalid_function() {
        let mut buf = [0x05, 0x00, 0x00, 0x00];
        let crc = crc16(&buf[..2]);
        buf[2..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            decode_rtu_frame(&buf),
            Err(CodecError::InvalidFunction(0x00))
        );
        assert!(RtuFrame::new(1, 0x80, &[]).is_err());
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let mut buf = [0u8; 4];
        assert_eq!(
            encode_rtu_frame(&read_holding(), &mut buf),
            Err(CodecError::FrameTooLarge { len: 8, max: 4 })
        );
    }

    // ========================================================================
    // Exception Tests
    // ========================================================================

    #[test]
    fn test_exception_frame() {
        let frame = RtuFrame::exception(7, 0x03, 0x0B);
        assert!(frame.is_exception());
        assert_eq!(frame.function(), 0x83);
        assert_eq!(frame.exception_code(), Some(0x0B));
        assert!(!read_holding().is_exception());
        assert_eq!(read_holding().exception_code(), None);
    }

    // ========================================================================
    // ADU Tests
    // ========================================================================

    #[test]
    fn test_adu_round_trip() {
        let adu = Adu {
            transaction_id: 0x1234,
            frame: RtuFrame::new(17, 0x03, &[0x00, 0x6B, 0x00, 0x03]).unwrap(),
        };
        let mut buf = [0u8; MAX_ADU_SIZE];
        let len = encode_adu(&adu, &mut buf).unwrap();
        assert_eq!(
            &buf[..len],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
        assert_eq!(decode_adu(&buf[..len]).unwrap(), adu);
    }

    #[test]
    fn test_adu_round_trip_every_length() {
        let mut buf = [0u8; MAX_ADU_SIZE];
        for unit in [0, 1, 247] {
            for len in 0..=MAX_PDU_DATA {
                let adu = Adu {
                    transaction_id: len as u16,
                    frame: RtuFrame::new(unit, 0x17, &[len as u8; MAX_PDU_DATA][..len]).unwrap(),
                };
                let written = encode_adu(&adu, &mut buf).unwrap();
                assert_eq!(written, MBAP_HEADER_LEN + 2 + len);
                assert_eq!(decode_adu(&buf[..written]).unwrap(), adu);
            }
        }
    }

    #[test]
    fn test_adu_length_mismatch() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            decode_adu(&bytes),
            Err(CodecError::LengthMismatch {
                declared: 9,
                actual: 6
            })
        );
    }

    #[test]
    fn test_adu_invalid_protocol_id() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x03, 0x01, 0x03, 0x02];
        assert_eq!(decode_adu(&bytes), Err(CodecError::InvalidProtocolId(1)));
    }

    #[test]
    fn test_adu_unit_id_range() {
        let mut bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xF7, 0x11];
        assert!(decode_adu(&bytes).is_ok());

        bytes[6] = 248;
        assert_eq!(decode_adu(&bytes), Err(CodecError::InvalidUnitId(248)));

        bytes[6] = 0;
        assert!(decode_adu(&bytes).unwrap().frame.is_broadcast());
    }

    #[test]
    fn test_adu_truncated_and_too_large() {
        assert_eq!(
            decode_adu(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01]),
            Err(CodecError::Truncated)
        );
        let bytes = [0u8; MAX_ADU_SIZE + 1];
        assert!(matches!(
            decode_adu(&bytes),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_mbap_header_parse() {
        let header = MbapHeader::parse(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01]).unwrap();
        assert_eq!(
            header,
            MbapHeader {
                transaction_id: 0x1234,
                protocol_id: 0,
                length: 6,
                unit_id: 1,
            }
        );
    }
}
