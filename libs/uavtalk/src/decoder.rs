use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{trace, warn};
use uavo::{ObjectId, ObjectInstance, SchemaRegistry};
use zerocopy::FromBytes;

use crate::{
    CRC, FrameHeader, HEADER_LEN, LOG_RECORD_HEADER_LEN, MAX_PAYLOAD, MessageKind, SYNC,
    TIMESTAMP_LEN,
};

/// Link level events that are not object updates.
///
/// Every method defaults to doing nothing, so a receiver only implements the
/// events it cares about.
pub trait LinkEvents {
    fn object_acked(&mut self, _obj_id: ObjectId, _inst_id: u16) {}

    fn object_nacked(&mut self, _obj_id: ObjectId, _inst_id: u16) {}

    /// The peer sent an object and expects an ACK for it.
    fn ack_requested(&mut self, _obj_id: ObjectId, _inst_id: u16) {}

    fn file_chunk(&mut self, _file_id: u32, _offset: u32, _data: &[u8], _eof: bool) {}

    fn object_requested(&mut self, _obj_id: ObjectId, _inst_id: u16) {}

    fn file_requested(&mut self, _file_id: u32, _offset: u32) {}
}

impl LinkEvents for () {}

#[derive(Clone, Copy, Debug, Default)]
pub struct DecoderConfig {
    /// Stamp objects with the local clock instead of the link timestamp.
    pub use_walltime: bool,
    /// Input is a GCS log: every packet is prefixed by a timestamp and size.
    pub gcs_timestamps: bool,
}

impl DecoderConfig {
    pub fn with_walltime(mut self, use_walltime: bool) -> Self {
        self.use_walltime = use_walltime;
        self
    }

    pub fn with_gcs_timestamps(mut self, gcs_timestamps: bool) -> Self {
        self.gcs_timestamps = gcs_timestamps;
        self
    }
}

/// Resumable frame decoder.
///
/// Bytes are pushed in arbitrary chunks; a partial frame stays buffered until
/// the rest arrives. Garbage and frames failing the CRC are skipped one byte
/// at a time until the next sync byte.
pub struct Decoder {
    registry: Arc<SchemaRegistry>,
    config: DecoderConfig,
    frame: Vec<u8>,
    records: Vec<u8>,
    stats: DecoderStats,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub crc_errors: u64,
    pub unknown_objects: u64,
    pub dropped_bytes: u64,
}

impl Decoder {
    pub fn new(registry: Arc<SchemaRegistry>, config: DecoderConfig) -> Self {
        Decoder {
            registry,
            config,
            frame: Vec::new(),
            records: Vec::new(),
            stats: DecoderStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn feed(&mut self, data: &[u8], events: &mut impl LinkEvents) -> Vec<ObjectInstance> {
        let mut out = Vec::new();
        if self.config.gcs_timestamps {
            self.records.extend_from_slice(data);
            let mut pos = 0;
            while let Some(header) = self.records.get(pos..pos + LOG_RECORD_HEADER_LEN) {
                let ts = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                let mut size = [0u8; 8];
                size.copy_from_slice(&header[4..]);
                let Ok(size) = usize::try_from(u64::from_le_bytes(size)) else {
                    warn!(pos, "corrupt log record size, dropping buffered data");
                    pos = self.records.len();
                    break;
                };
                let start = pos + LOG_RECORD_HEADER_LEN;
                let Some(packet) = start.checked_add(size).and_then(|end| self.records.get(start..end)) else {
                    break;
                };
                self.frame.extend_from_slice(packet);
                pos = start + size;
                self.parse(Some(ts as u64), events, &mut out);
            }
            self.records.drain(..pos);
        } else {
            self.frame.extend_from_slice(data);
            self.parse(None, events, &mut out);
        }
        out
    }

    fn drop_bytes(&mut self, n: usize) {
        self.frame.drain(..n);
        self.stats.dropped_bytes += n as u64;
    }

    fn parse(
        &mut self,
        record_ts: Option<u64>,
        events: &mut impl LinkEvents,
        out: &mut Vec<ObjectInstance>,
    ) {
        loop {
            match self.frame.iter().position(|b| *b == SYNC) {
                Some(0) => {}
                Some(n) => self.drop_bytes(n),
                None => {
                    let n = self.frame.len();
                    self.drop_bytes(n);
                    return;
                }
            }
            let Ok((header, _)) = FrameHeader::read_from_prefix(&self.frame) else {
                return;
            };
            let ts_len = if header.is_timestamped() { TIMESTAMP_LEN } else { 0 };
            let length = header.length.get() as usize;
            let min_len = HEADER_LEN + ts_len;
            if !header.has_valid_version() || length < min_len || length > min_len + MAX_PAYLOAD {
                trace!(ty = header.ty, length, "bad frame header");
                self.drop_bytes(1);
                continue;
            }
            let Some(frame) = self.frame.get(..=length) else {
                return;
            };
            let (body, crc) = frame.split_at(length);
            if CRC.checksum(body) != crc[0] {
                self.stats.crc_errors += 1;
                trace!(obj_id = header.obj_id.get(), "crc mismatch");
                self.drop_bytes(1);
                continue;
            }

            let frame_ts = (ts_len > 0)
                .then(|| u16::from_le_bytes([body[HEADER_LEN], body[HEADER_LEN + 1]]) as u64);
            let payload = body[min_len..].to_vec();
            self.frame.drain(..=length);
            self.stats.frames += 1;

            let timestamp = if self.config.use_walltime {
                walltime_ms()
            } else {
                record_ts.or(frame_ts).unwrap_or(0)
            };
            if let Some(instance) = self.handle(&header, timestamp, &payload, events) {
                out.push(instance);
            }
        }
    }

    fn handle(
        &mut self,
        header: &FrameHeader,
        timestamp: u64,
        payload: &[u8],
        events: &mut impl LinkEvents,
    ) -> Option<ObjectInstance> {
        let obj_id = ObjectId(header.obj_id.get());
        let inst_id = header.inst_id.get();
        let kind = match header.kind() {
            Ok(kind) => kind,
            Err(kind) => {
                trace!(kind, "unknown message kind");
                return None;
            }
        };
        match kind {
            MessageKind::Object | MessageKind::ObjectAck => {
                let Some(def) = self.registry.get(obj_id) else {
                    self.stats.unknown_objects += 1;
                    trace!(%obj_id, "unknown object");
                    return None;
                };
                if payload.len() != def.layout().data_size() {
                    warn!(
                        object = def.name(),
                        len = payload.len(),
                        expected = def.layout().data_size(),
                        "object payload size mismatch"
                    );
                    return None;
                }
                let instance = match def.decode_fields(payload, Some(inst_id), timestamp) {
                    Ok(instance) => instance,
                    Err(err) => {
                        warn!(object = def.name(), %err, "unable to decode object");
                        return None;
                    }
                };
                if kind == MessageKind::ObjectAck {
                    events.ack_requested(obj_id, inst_id);
                }
                Some(instance)
            }
            MessageKind::ObjectRequest => {
                events.object_requested(obj_id, inst_id);
                None
            }
            MessageKind::Ack => {
                events.object_acked(obj_id, inst_id);
                None
            }
            MessageKind::Nack => {
                events.object_nacked(obj_id, inst_id);
                None
            }
            MessageKind::FileRequest => {
                match payload.get(..4) {
                    Some(b) => events.file_requested(obj_id.0, u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                    None => trace!("short file request"),
                }
                None
            }
            MessageKind::FileData => {
                if payload.len() < 5 {
                    trace!("short file chunk");
                    return None;
                }
                let offset = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let eof = payload[4] & 0x01 != 0;
                events.file_chunk(obj_id.0, offset, &payload[5..], eof);
                None
            }
        }
    }
}

fn walltime_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{acknowledge_object, file_chunk, log_record, nack_object, request_object, send_object};

    const GYRO: &str = r#"<xml>
  <object name="Gyros" singleinstance="true" settings="false">
    <description>Gyro rates.</description>
    <field name="x" units="deg/s" type="float" elements="1"/>
    <field name="y" units="deg/s" type="float" elements="1"/>
    <field name="z" units="deg/s" type="float" elements="1"/>
    <field name="temperature" units="deg C" type="int8" elements="1"/>
  </object>
</xml>"#;

    fn setup() -> (Decoder, ObjectInstance) {
        let registry = Arc::new(SchemaRegistry::from_xml([GYRO]).unwrap());
        let def = registry.find_by_name("Gyros").unwrap().clone();
        let mut inst = ObjectInstance::new(&def);
        inst.set("y", uavo::Value::F32(-2.5)).unwrap();
        inst.set("temperature", uavo::Value::I8(31)).unwrap();
        (Decoder::new(registry, DecoderConfig::default()), inst)
    }

    #[derive(Default)]
    struct Recorder {
        acked: Vec<(ObjectId, u16)>,
        nacked: Vec<(ObjectId, u16)>,
        ack_requested: Vec<(ObjectId, u16)>,
        requested: Vec<(ObjectId, u16)>,
        chunks: Vec<(u32, u32, Vec<u8>, bool)>,
    }

    impl LinkEvents for Recorder {
        fn object_acked(&mut self, obj_id: ObjectId, inst_id: u16) {
            self.acked.push((obj_id, inst_id));
        }
        fn object_nacked(&mut self, obj_id: ObjectId, inst_id: u16) {
            self.nacked.push((obj_id, inst_id));
        }
        fn ack_requested(&mut self, obj_id: ObjectId, inst_id: u16) {
            self.ack_requested.push((obj_id, inst_id));
        }
        fn object_requested(&mut self, obj_id: ObjectId, inst_id: u16) {
            self.requested.push((obj_id, inst_id));
        }
        fn file_chunk(&mut self, file_id: u32, offset: u32, data: &[u8], eof: bool) {
            self.chunks.push((file_id, offset, data.to_vec(), eof));
        }
    }

    #[test]
    fn byte_at_a_time() {
        let (mut decoder, inst) = setup();
        let frame = send_object(&inst, false).unwrap();
        let mut out = Vec::new();
        for b in &frame {
            out.extend(decoder.feed(std::slice::from_ref(b), &mut ()));
        }
        assert_eq!(out, [inst]);
    }

    #[test]
    fn resyncs_after_garbage_and_bad_crc() {
        let (mut decoder, inst) = setup();
        let good = send_object(&inst, false).unwrap();
        let mut corrupt = good.clone();
        *corrupt.last_mut().unwrap() ^= 0xFF;

        let mut stream = vec![0x00, SYNC, 0x99, 0x3C];
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&[0x12, 0x34]);
        stream.extend_from_slice(&good);

        let out = decoder.feed(&stream, &mut ());
        assert_eq!(out, [inst]);
        assert!(decoder.stats().crc_errors >= 1);
        assert_eq!(decoder.stats().frames, 1);
    }

    #[test]
    fn link_events() {
        let (mut decoder, inst) = setup();
        let id = inst.id();
        let mut stream = send_object(&inst, true).unwrap();
        stream.extend(acknowledge_object(id, 0));
        stream.extend(nack_object(id, 1));
        stream.extend(request_object(id, 0));
        stream.extend(file_chunk(3, 0, b"hello", false).unwrap());
        stream.extend(file_chunk(3, 5, b"", true).unwrap());

        let mut events = Recorder::default();
        let out = decoder.feed(&stream, &mut events);
        assert_eq!(out.len(), 1);
        assert_eq!(events.ack_requested, [(id, 0)]);
        assert_eq!(events.acked, [(id, 0)]);
        assert_eq!(events.nacked, [(id, 1)]);
        assert_eq!(events.requested, [(id, 0)]);
        assert_eq!(
            events.chunks,
            [(3, 0, b"hello".to_vec(), false), (3, 5, vec![], true)]
        );
    }

    #[test]
    fn unknown_objects_are_skipped() {
        let (mut decoder, inst) = setup();
        let mut stream =
            crate::encode_frame(MessageKind::Object, ObjectId(0xDEAD_BEE0), 0, None, &[1, 2, 3]).unwrap();
        stream.extend(send_object(&inst, false).unwrap());
        assert_eq!(decoder.feed(&stream, &mut ()).len(), 1);
        assert_eq!(decoder.stats().unknown_objects, 1);
    }

    #[test]
    fn frame_and_log_timestamps() {
        let (mut decoder, inst) = setup();
        let payload = inst.definition().encode_fields(&inst);
        let frame = crate::encode_frame(MessageKind::Object, inst.id(), 0, Some(1234), &payload).unwrap();
        let out = decoder.feed(&frame, &mut ());
        assert_eq!(out[0].timestamp(), 1234);

        let registry = decoder.registry().clone();
        let mut logs = Decoder::new(registry, DecoderConfig::default().with_gcs_timestamps(true));
        let mut log = log_record(70_000, &send_object(&inst, false).unwrap());
        log.extend(log_record(70_010, &frame));
        let (first, rest) = log.split_at(15);
        assert!(logs.feed(first, &mut ()).is_empty());
        let out = logs.feed(rest, &mut ());
        let stamps: Vec<u64> = out.iter().map(|i| i.timestamp()).collect();
        assert_eq!(stamps, [70_000, 70_010]);
    }
}
