//! UAVTalk framing.
//!
//! ```text
//! | sync | type | length  | object id | instance id | [timestamp] | payload  | crc8 |
//! | 0x3C | u8   | u16 LE  | u32 LE    | u16 LE      | [u16 LE]    | <= 255 B | u8   |
//! ```
//!
//! `length` counts everything before the payload plus the payload itself.
//! The CRC covers every byte before it.

use crc::{CRC_8_SMBUS, Crc};
use uavo::{ObjectId, ObjectInstance};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod decoder;
pub mod error;

pub use decoder::{Decoder, DecoderConfig, LinkEvents};
pub use error::Error;

pub const SYNC: u8 = 0x3C;
pub const VERSION: u8 = 0x20;
pub const VERSION_MASK: u8 = 0x70;
pub const KIND_MASK: u8 = 0x0F;
pub const TIMESTAMPED: u8 = 0x80;
pub const MAX_PAYLOAD: usize = 255;
pub const HEADER_LEN: usize = size_of::<FrameHeader>();
pub const TIMESTAMP_LEN: usize = 2;
/// Bytes in front of the packet in GCS log records: timestamp u32, size u64.
pub const LOG_RECORD_HEADER_LEN: usize = 12;

/// CRC-8, polynomial 0x07, zero init.
pub const CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Object = 0,
    ObjectRequest = 1,
    ObjectAck = 2,
    Ack = 3,
    Nack = 4,
    FileRequest = 8,
    FileData = 9,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        Ok(match kind {
            0 => MessageKind::Object,
            1 => MessageKind::ObjectRequest,
            2 => MessageKind::ObjectAck,
            3 => MessageKind::Ack,
            4 => MessageKind::Nack,
            8 => MessageKind::FileRequest,
            9 => MessageKind::FileData,
            other => return Err(other),
        })
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FrameHeader {
    pub sync: u8,
    pub ty: u8,
    pub length: U16,
    pub obj_id: U32,
    pub inst_id: U16,
}

impl FrameHeader {
    pub fn kind(&self) -> Result<MessageKind, u8> {
        MessageKind::try_from(self.ty & KIND_MASK)
    }

    pub fn is_timestamped(&self) -> bool {
        self.ty & TIMESTAMPED != 0
    }

    pub fn has_valid_version(&self) -> bool {
        self.ty & VERSION_MASK == VERSION
    }
}

/// Builds one complete frame.
pub fn encode_frame(
    kind: MessageKind,
    obj_id: ObjectId,
    inst_id: u16,
    timestamp: Option<u16>,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let ts_len = if timestamp.is_some() { TIMESTAMP_LEN } else { 0 };
    let length = HEADER_LEN + ts_len + payload.len();
    let mut ty = VERSION | kind as u8;
    if timestamp.is_some() {
        ty |= TIMESTAMPED;
    }
    let header = FrameHeader {
        sync: SYNC,
        ty,
        length: U16::new(length as u16),
        obj_id: U32::new(obj_id.0),
        inst_id: U16::new(inst_id),
    };

    let mut frame = Vec::with_capacity(length + 1);
    frame.extend_from_slice(header.as_bytes());
    if let Some(ts) = timestamp {
        frame.extend_from_slice(&ts.to_le_bytes());
    }
    frame.extend_from_slice(payload);
    frame.push(CRC.checksum(&frame));
    Ok(frame)
}

/// Object update, optionally asking the peer to acknowledge it.
pub fn send_object(instance: &ObjectInstance, req_ack: bool) -> Result<Vec<u8>, Error> {
    let kind = if req_ack {
        MessageKind::ObjectAck
    } else {
        MessageKind::Object
    };
    let payload = instance.definition().encode_fields(instance);
    encode_frame(kind, instance.id(), instance.instance_id(), None, &payload)
}

pub fn request_object(obj_id: ObjectId, inst_id: u16) -> Vec<u8> {
    empty_frame(MessageKind::ObjectRequest, obj_id, inst_id)
}

pub fn acknowledge_object(obj_id: ObjectId, inst_id: u16) -> Vec<u8> {
    empty_frame(MessageKind::Ack, obj_id, inst_id)
}

pub fn nack_object(obj_id: ObjectId, inst_id: u16) -> Vec<u8> {
    empty_frame(MessageKind::Nack, obj_id, inst_id)
}

/// Asks for the chunk of file `file_id` starting at `offset`.
pub fn request_file_chunk(file_id: u32, offset: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + 5);
    frame.extend_from_slice(
        FrameHeader {
            sync: SYNC,
            ty: VERSION | MessageKind::FileRequest as u8,
            length: U16::new((HEADER_LEN + 4) as u16),
            obj_id: U32::new(file_id),
            inst_id: U16::new(0),
        }
        .as_bytes(),
    );
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.push(CRC.checksum(&frame));
    frame
}

/// One chunk of a file, as sent by the flight side.
pub fn file_chunk(file_id: u32, offset: u32, data: &[u8], eof: bool) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::with_capacity(5 + data.len());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.push(eof as u8);
    payload.extend_from_slice(data);
    encode_frame(MessageKind::FileData, ObjectId(file_id), 0, None, &payload)
}

/// Wraps a packet into a GCS log record.
pub fn log_record(timestamp: u32, packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOG_RECORD_HEADER_LEN + packet.len());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&(packet.len() as u64).to_le_bytes());
    out.extend_from_slice(packet);
    out
}

fn empty_frame(kind: MessageKind, obj_id: ObjectId, inst_id: u16) -> Vec<u8> {
    let header = FrameHeader {
        sync: SYNC,
        ty: VERSION | kind as u8,
        length: U16::new(HEADER_LEN as u16),
        obj_id: U32::new(obj_id.0),
        inst_id: U16::new(inst_id),
    };
    let mut frame = header.as_bytes().to_vec();
    frame.push(CRC.checksum(&frame));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference() {
        // CRC-8/SMBUS check value
        assert_eq!(CRC.checksum(b"123456789"), 0xF4);
    }

    #[test]
    fn request_layout() {
        let frame = request_object(ObjectId(0x1234_5678), 2);
        assert_eq!(
            &frame[..10],
            &[0x3C, 0x21, 10, 0, 0x78, 0x56, 0x34, 0x12, 2, 0]
        );
        assert_eq!(frame.len(), 11);
        assert_eq!(frame[10], CRC.checksum(&frame[..10]));
    }

    #[test]
    fn file_request_carries_offset() {
        let frame = request_file_chunk(7, 0x0100);
        assert_eq!(frame[1], 0x28);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 14);
        assert_eq!(&frame[10..14], &[0x00, 0x01, 0, 0]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(matches!(
            encode_frame(MessageKind::Object, ObjectId(2), 0, None, &[0; 256]),
            Err(Error::PayloadTooLarge { len: 256, .. })
        ));
        let frame = encode_frame(MessageKind::Object, ObjectId(2), 0, Some(500), &[1; 255]).unwrap();
        assert_eq!(frame[1], 0xA0);
        assert_eq!(frame.len(), HEADER_LEN + 2 + 255 + 1);
    }
}
