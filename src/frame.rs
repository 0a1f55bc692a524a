//! Modbus framing on both sides of the bridge.
//!
//! Network peers speak Modbus TCP: a 7 byte MBAP header followed by the PDU. The PSU speaks
//! Modbus RTU: unit id, PDU and a CRC16 (low byte first). The bridge never looks inside the PDU
//! beyond its function code, it only swaps one envelope for the other.

use rmodbus::ModbusProto;

use crate::error::{Error, Result};

/// Largest RTU ADU allowed on the serial line.
pub const MAX_RTU_ADU_LEN: usize = 256;
/// Largest PDU carried by either protocol.
pub const MAX_PDU_LEN: usize = 253;
/// Length of the Modbus TCP MBAP header, unit id included.
pub const MBAP_HEADER_LEN: usize = 7;

/// Buffer holding one RTU frame.
pub type RtuBuffer = heapless::Vec<u8, MAX_RTU_ADU_LEN>;

/// Exception codes the bridge may answer with on behalf of the PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    /// The serial side of the gateway is gone.
    GatewayPathUnavailable = 0x0A,
    /// The PSU did not answer (or could not be asked in time).
    GatewayTargetFailedToRespond = 0x0B,
}

/// The MBAP header in front of every Modbus TCP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always `0` for Modbus.
    pub protocol_id: u16,
    /// Number of bytes following the length field (unit id + PDU).
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Header for a PDU of `pdu_len` bytes.
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_len as u16 + 1,
            unit_id,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(Error::InvalidFrame);
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(Error::InvalidFrame);
        }
        header.pdu_len()?;
        Ok(header)
    }

    /// Length of the PDU announced by this header.
    pub fn pdu_len(&self) -> Result<usize> {
        let len = usize::from(self.length)
            .checked_sub(1)
            .ok_or(Error::InvalidFrame)?;
        if len == 0 || len > MAX_PDU_LEN {
            return Err(Error::InvalidFrame);
        }
        Ok(len)
    }

    pub fn encode(&self) -> [u8; MBAP_HEADER_LEN] {
        let tid = self.transaction_id.to_be_bytes();
        let pid = self.protocol_id.to_be_bytes();
        let len = self.length.to_be_bytes();
        [tid[0], tid[1], pid[0], pid[1], len[0], len[1], self.unit_id]
    }
}

/// Build a complete Modbus TCP ADU.
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&MbapHeader::new(transaction_id, unit_id, pdu.len()).encode());
    adu.extend_from_slice(pdu);
    adu
}

/// Wrap a PDU for the serial line.
pub fn encode_rtu(unit_id: u8, pdu: &[u8]) -> Result<RtuBuffer> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(Error::InvalidFrame);
    }
    let mut frame = RtuBuffer::new();
    frame.push(unit_id).map_err(|_| Error::InvalidFrame)?;
    frame
        .extend_from_slice(pdu)
        .map_err(|_| Error::InvalidFrame)?;
    let crc = rmodbus::calc_crc16(&frame, frame.len() as u8);
    frame
        .extend_from_slice(&crc.to_le_bytes())
        .map_err(|_| Error::InvalidFrame)?;
    Ok(frame)
}

/// Split an RTU frame into unit id and PDU, checking its CRC.
pub fn decode_rtu(frame: &[u8]) -> Result<(u8, &[u8])> {
    // unit id + function code + CRC
    if frame.len() < 4 || frame.len() > MAX_RTU_ADU_LEN {
        return Err(Error::InvalidFrame);
    }
    let data_len = frame.len() - 2;
    let crc = rmodbus::calc_crc16(frame, data_len as u8);
    if crc.to_le_bytes() != frame[data_len..] {
        return Err(Error::InvalidResponse);
    }
    Ok((frame[0], &frame[1..data_len]))
}

/// How long the RTU response starting with `partial` will be, once enough of it has arrived
/// to tell. `None` means more bytes are needed.
pub fn expected_response_len(partial: &[u8]) -> Result<Option<usize>> {
    if partial.len() < 3 {
        return Ok(None);
    }
    // unit id, function | 0x80, exception code, CRC
    if partial[1] & 0x80 != 0 {
        return Ok(Some(5));
    }
    let len = rmodbus::guess_response_frame_len(partial, ModbusProto::Rtu)?;
    Ok(Some(usize::from(len)))
}

/// The PDU sent back when a request for `function` fails with `code`.
pub fn exception_pdu(function: u8, code: ExceptionCode) -> [u8; 2] {
    [function | 0x80, code as u8]
}
