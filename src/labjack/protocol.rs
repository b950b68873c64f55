use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::{Cursor, Read};

use super::registers::RegisterType;
use crate::error::GalvoError;

// Modbus TCP constants
pub const MBAP_HEADER_SIZE: usize = 7;
pub const PROTOCOL_ID: u16 = 0;
pub const DEFAULT_UNIT_ID: u8 = 1;
pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const EXCEPTION_FLAG: u8 = 0x80;
pub const MAX_READ_WORDS: u16 = 125;
pub const MAX_WRITE_WORDS: u16 = 123;
/// Largest PDU a Modbus TCP frame may carry
pub const MAX_PDU_SIZE: usize = 253;

/// Modbus application protocol header that prefixes every TCP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of the unit id plus the PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    fn to_bytes(self) -> [u8; MBAP_HEADER_SIZE] {
        let mut buf = [0u8; MBAP_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6] = self.unit_id;
        buf
    }

    /// Number of PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// Low-level Modbus TCP framing for the T7
pub struct Protocol;

impl Protocol {
    fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let header = MbapHeader {
            transaction_id,
            protocol_id: PROTOCOL_ID,
            length: (pdu.len() + 1) as u16,
            unit_id,
        };
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(pdu);
        frame
    }

    /// Build a Write Multiple Registers (0x10) request
    pub fn encode_write_registers(
        transaction_id: u16,
        unit_id: u8,
        start: u16,
        words: &[u16],
    ) -> Result<Vec<u8>, GalvoError> {
        if words.is_empty() || words.len() > MAX_WRITE_WORDS as usize {
            return Err(GalvoError::Protocol(format!(
                "cannot write {} registers in one frame",
                words.len()
            )));
        }

        let mut pdu = Vec::with_capacity(6 + words.len() * 2);
        pdu.write_u8(FN_WRITE_MULTIPLE_REGISTERS)?;
        pdu.write_u16::<BigEndian>(start)?;
        pdu.write_u16::<BigEndian>(words.len() as u16)?;
        pdu.write_u8((words.len() * 2) as u8)?;
        for word in words {
            pdu.write_u16::<BigEndian>(*word)?;
        }
        Ok(Self::frame(transaction_id, unit_id, &pdu))
    }

    /// Build a Read Holding Registers (0x03) request
    pub fn encode_read_registers(
        transaction_id: u16,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u8>, GalvoError> {
        if count == 0 || count > MAX_READ_WORDS {
            return Err(GalvoError::Protocol(format!(
                "cannot read {count} registers in one frame"
            )));
        }

        let mut pdu = Vec::with_capacity(5);
        pdu.write_u8(FN_READ_HOLDING_REGISTERS)?;
        pdu.write_u16::<BigEndian>(start)?;
        pdu.write_u16::<BigEndian>(count)?;
        Ok(Self::frame(transaction_id, unit_id, &pdu))
    }

    pub fn read_header(reader: &mut dyn Read) -> Result<MbapHeader, GalvoError> {
        let mut buf = [0u8; MBAP_HEADER_SIZE];
        reader.read_exact(&mut buf).map_err(|e| {
            debug!("Failed to read Modbus header: {} (kind: {:?})", e, e.kind());
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                GalvoError::Timeout
            } else {
                GalvoError::Io {
                    source: e,
                    context: "Failed to read Modbus header from T7".to_string(),
                }
            }
        })?;
        Self::decode_header(&buf)
    }

    pub fn decode_header(buf: &[u8; MBAP_HEADER_SIZE]) -> Result<MbapHeader, GalvoError> {
        let mut cursor = Cursor::new(&buf[..]);
        let header = MbapHeader {
            transaction_id: cursor.read_u16::<BigEndian>()?,
            protocol_id: cursor.read_u16::<BigEndian>()?,
            length: cursor.read_u16::<BigEndian>()?,
            unit_id: cursor.read_u8()?,
        };

        if header.protocol_id != PROTOCOL_ID {
            return Err(GalvoError::Protocol(format!(
                "unexpected protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.pdu_len() > MAX_PDU_SIZE {
            return Err(GalvoError::Protocol(format!(
                "invalid frame length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Fail with `DeviceException` if the response PDU is a Modbus exception
    fn check_exception(pdu: &[u8], function: u8) -> Result<(), GalvoError> {
        match pdu.first() {
            Some(&code) if code == function => Ok(()),
            Some(&code) if code == function | EXCEPTION_FLAG => Err(GalvoError::DeviceException {
                function,
                code: pdu.get(1).copied().unwrap_or(0),
            }),
            Some(&code) => Err(GalvoError::Protocol(format!(
                "expected function 0x{function:02x}, got 0x{code:02x}"
            ))),
            None => Err(GalvoError::Protocol("empty response".to_string())),
        }
    }

    /// Decode the register words of a Read Holding Registers response
    pub fn decode_read_response(pdu: &[u8], expected: u16) -> Result<Vec<u16>, GalvoError> {
        Self::check_exception(pdu, FN_READ_HOLDING_REGISTERS)?;

        let byte_count = *pdu
            .get(1)
            .ok_or_else(|| GalvoError::Protocol("read response truncated".to_string()))?
            as usize;
        if byte_count != expected as usize * 2 {
            return Err(GalvoError::Protocol(format!(
                "expected {} data bytes, got {}",
                expected as usize * 2,
                byte_count
            )));
        }

        let data = pdu
            .get(2..2 + byte_count)
            .ok_or_else(|| GalvoError::Protocol("read response truncated".to_string()))?;
        let mut cursor = Cursor::new(data);
        (0..expected)
            .map(|_| cursor.read_u16::<BigEndian>().map_err(GalvoError::from))
            .collect()
    }

    /// Verify the echo of a Write Multiple Registers response
    pub fn check_write_response(pdu: &[u8], start: u16, count: u16) -> Result<(), GalvoError> {
        Self::check_exception(pdu, FN_WRITE_MULTIPLE_REGISTERS)?;

        let mut cursor = Cursor::new(pdu.get(1..).unwrap_or_default());
        let echoed_start = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| GalvoError::Protocol("write response truncated".to_string()))?;
        let echoed_count = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| GalvoError::Protocol("write response truncated".to_string()))?;

        if echoed_start != start || echoed_count != count {
            return Err(GalvoError::Protocol(format!(
                "write echo mismatch: sent {count} words at {start}, \
                 device acknowledged {echoed_count} at {echoed_start}"
            )));
        }
        Ok(())
    }

    /// Encode a value in the register's native representation
    pub fn value_to_words(value: f64, kind: RegisterType) -> Result<Vec<u16>, GalvoError> {
        match kind {
            RegisterType::Float32 => {
                let bits = (value as f32).to_bits();
                Ok(vec![(bits >> 16) as u16, bits as u16])
            }
            RegisterType::Uint16 => {
                if !(0.0..=u16::MAX as f64).contains(&value) {
                    return Err(GalvoError::Protocol(format!(
                        "{value} does not fit a UINT16 register"
                    )));
                }
                Ok(vec![value.round() as u16])
            }
        }
    }

    /// Decode a value from the register's native representation
    pub fn words_to_value(words: &[u16], kind: RegisterType) -> Result<f64, GalvoError> {
        match (kind, words) {
            (RegisterType::Float32, [high, low]) => {
                let bits = ((*high as u32) << 16) | *low as u32;
                Ok(f32::from_bits(bits) as f64)
            }
            (RegisterType::Uint16, [word]) => Ok(*word as f64),
            _ => Err(GalvoError::Protocol(format!(
                "{} words do not form a {:?} value",
                words.len(),
                kind
            ))),
        }
    }
}
