//! Recovery of settings objects from raw dumps of the slot-based flash
//! filesystem.
//!
//! The partition is a sequence of arenas, each starting with an
//! [`ArenaHeader`] and followed by fixed-width slots. Every slot starts with a
//! [`SlotHeader`] and holds one object's field data. Objects are never
//! rewritten in place: an update appends a new slot, so the same
//! `(object, instance)` can appear many times in a dump.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace, warn};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::definition::ObjectDefinition;
use crate::instance::ObjectInstance;
use crate::registry::SchemaRegistry;
use crate::types::ObjectId;

/// Magic of the settings partition.
pub const SETTINGS_MAGIC: u32 = 0x3bb1_41cf;
pub const DEFAULT_SLOT_SIZE: usize = 256;
pub const DEFAULT_ARENA_SIZE: usize = 16384;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaState {
    Erased,
    Reserved,
    Active,
    Obsolete,
    Unknown(u32),
}

impl ArenaState {
    pub const ERASED: u32 = 0xFFFF_FFFF;
    pub const RESERVED: u32 = 0xE6E6_FFFF;
    pub const ACTIVE: u32 = 0xE6E6_6666;
    pub const OBSOLETE: u32 = 0x0000_0000;
}

impl From<u32> for ArenaState {
    fn from(v: u32) -> Self {
        match v {
            Self::ERASED => ArenaState::Erased,
            Self::RESERVED => ArenaState::Reserved,
            Self::ACTIVE => ArenaState::Active,
            Self::OBSOLETE => ArenaState::Obsolete,
            other => ArenaState::Unknown(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Reserved,
    Active,
    Obsolete,
    Unknown(u32),
}

impl SlotState {
    pub const EMPTY: u32 = 0xFFFF_FFFF;
    pub const RESERVED: u32 = 0xFAFA_FAFA;
    pub const ACTIVE: u32 = 0xAAAA_AAAA;
    pub const OBSOLETE: u32 = 0x0000_0000;
}

impl From<u32> for SlotState {
    fn from(v: u32) -> Self {
        match v {
            Self::EMPTY => SlotState::Empty,
            Self::RESERVED => SlotState::Reserved,
            Self::ACTIVE => SlotState::Active,
            Self::OBSOLETE => SlotState::Obsolete,
            other => SlotState::Unknown(other),
        }
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct ArenaHeader {
    pub magic: U32,
    pub state: U32,
}

impl ArenaHeader {
    pub fn new(magic: u32, state: u32) -> Self {
        ArenaHeader {
            magic: magic.into(),
            state: state.into(),
        }
    }

    pub fn state(&self) -> ArenaState {
        self.state.get().into()
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct SlotHeader {
    pub state: U32,
    pub obj_id: U32,
    pub obj_inst_id: U16,
    pub size: U16,
}

impl SlotHeader {
    pub fn new(state: u32, obj_id: ObjectId, obj_inst_id: u16, size: u16) -> Self {
        SlotHeader {
            state: state.into(),
            obj_id: obj_id.0.into(),
            obj_inst_id: obj_inst_id.into(),
            size: size.into(),
        }
    }

    pub fn state(&self) -> SlotState {
        self.state.get().into()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogFsConfig {
    pub magic: u32,
    pub slot_size: usize,
    /// Only used to report which arena a slot belongs to.
    pub arena_size: usize,
}

impl Default for LogFsConfig {
    fn default() -> Self {
        LogFsConfig {
            magic: SETTINGS_MAGIC,
            slot_size: DEFAULT_SLOT_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl LogFsConfig {
    pub fn with_magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }
}

/// Latest recovered instance of every `(object, instance)` in a dump.
#[derive(Clone, Debug, Default)]
pub struct LogFsSnapshot {
    objects: IndexMap<(ObjectId, u16), ObjectInstance>,
}

impl LogFsSnapshot {
    pub fn get(&self, name: &str, instance_id: u16) -> Option<&ObjectInstance> {
        self.objects
            .values()
            .find(|i| i.name() == name && i.instance_id() == instance_id)
    }

    pub fn get_by_id(&self, id: ObjectId, instance_id: u16) -> Option<&ObjectInstance> {
        self.objects.get(&(id, instance_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectInstance> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn into_instances(self) -> impl Iterator<Item = ObjectInstance> {
        self.objects.into_values()
    }
}

/// Scans a flash dump, keeping the last ACTIVE slot seen for each key inside
/// an ACTIVE arena. An OBSOLETE slot found after an ACTIVE one for the same
/// key does not remove it.
pub fn scan(image: &[u8], registry: &SchemaRegistry, config: &LogFsConfig) -> LogFsSnapshot {
    let slot_size = config.slot_size.max(size_of::<SlotHeader>());
    let mut snapshot = LogFsSnapshot::default();
    let mut in_active_arena = false;
    let mut offset = 0;

    while image.len() - offset >= slot_size {
        let slot = &image[offset..offset + slot_size];
        let arena_index = offset / config.arena_size.max(1);

        if let Ok((arena, _)) = ArenaHeader::ref_from_prefix(slot) {
            if arena.magic.get() == config.magic {
                in_active_arena = arena.state() == ArenaState::Active;
                debug!(offset, arena = arena_index, state = ?arena.state(), "arena header");
                offset += slot_size;
                continue;
            }
        }

        if let Ok((header, payload)) = SlotHeader::ref_from_prefix(slot) {
            if header.state() == SlotState::Active && in_active_arena {
                if let Some(instance) = decode_slot(registry, header, payload, offset, arena_index) {
                    snapshot
                        .objects
                        .insert((instance.id(), instance.instance_id()), instance);
                }
            }
        }
        offset += slot_size;
    }
    snapshot
}

fn decode_slot(
    registry: &SchemaRegistry,
    header: &SlotHeader,
    payload: &[u8],
    offset: usize,
    arena: usize,
) -> Option<ObjectInstance> {
    let id = ObjectId(header.obj_id.get());
    let inst = header.obj_inst_id.get();
    let size = header.size.get() as usize;
    let def: &Arc<ObjectDefinition> = match registry.get(id) {
        Some(def) => def,
        None => {
            trace!(offset, %id, "unknown object in slot");
            return None;
        }
    };
    let expected = def.layout().data_size();
    if size != expected {
        warn!(offset, arena, object = def.name(), size, expected, "slot size mismatch");
        return None;
    }
    let Some(data) = payload.get(..size) else {
        warn!(offset, arena, object = def.name(), size, "slot payload overruns slot");
        return None;
    };
    match def.decode_fields(data, Some(inst), 0) {
        Ok(instance) => Some(instance),
        Err(err) => {
            warn!(offset, arena, object = def.name(), %err, "unable to decode slot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"<xml>
  <object name="FlashItem" singleinstance="false" settings="true">
    <description>Flash test object.</description>
    <field name="Value" units="" type="uint32" elements="1" defaultvalue="0"/>
  </object>
</xml>"#;

    const SLOT: usize = 32;

    struct Image {
        bytes: Vec<u8>,
    }

    impl Image {
        fn new() -> Self {
            Image { bytes: Vec::new() }
        }

        fn arena(mut self, state: u32) -> Self {
            let start = self.bytes.len();
            self.bytes.extend_from_slice(ArenaHeader::new(SETTINGS_MAGIC, state).as_bytes());
            self.bytes.resize(start + SLOT, 0xFF);
            self
        }

        fn slot(mut self, state: u32, id: ObjectId, inst: u16, value: u32) -> Self {
            let start = self.bytes.len();
            self.bytes
                .extend_from_slice(SlotHeader::new(state, id, inst, 4).as_bytes());
            self.bytes.extend_from_slice(&value.to_le_bytes());
            self.bytes.resize(start + SLOT, 0xFF);
            self
        }
    }

    fn setup() -> (SchemaRegistry, ObjectId, LogFsConfig) {
        let registry = SchemaRegistry::from_xml([ITEM]).unwrap();
        let id = registry.find_by_name("FlashItem").unwrap().id();
        (registry, id, LogFsConfig::default().with_slot_size(SLOT))
    }

    fn value(snapshot: &LogFsSnapshot, inst: u16) -> Option<u32> {
        match snapshot.get("FlashItem", inst)?.get("Value")? {
            crate::types::FieldValue::Scalar(crate::types::Value::U32(v)) => Some(*v),
            _ => None,
        }
    }

    #[test]
    fn last_active_slot_wins() {
        let (registry, id, config) = setup();
        let image = Image::new()
            .arena(ArenaState::ACTIVE)
            .slot(SlotState::ACTIVE, id, 0, 1)
            .slot(SlotState::OBSOLETE, id, 0, 1)
            .slot(SlotState::ACTIVE, id, 0, 2);
        let snapshot = scan(&image.bytes, &registry, &config);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(value(&snapshot, 0), Some(2));
    }

    #[test]
    fn inactive_arena_is_ignored() {
        let (registry, id, config) = setup();
        let image = Image::new()
            .arena(ArenaState::OBSOLETE)
            .slot(SlotState::ACTIVE, id, 0, 1)
            .arena(ArenaState::RESERVED)
            .slot(SlotState::ACTIVE, id, 1, 1)
            .arena(ArenaState::ACTIVE)
            .slot(SlotState::ACTIVE, id, 2, 7);
        let snapshot = scan(&image.bytes, &registry, &config);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(value(&snapshot, 2), Some(7));
        assert!(snapshot.get_by_id(id, 0).is_none());
    }

    #[test]
    fn skips_unknown_ids_bad_sizes_and_trailing_bytes() {
        let (registry, id, config) = setup();
        let mut image = Image::new()
            .arena(ArenaState::ACTIVE)
            .slot(SlotState::ACTIVE, ObjectId(0x1234), 0, 9)
            .slot(SlotState::RESERVED, id, 3, 9)
            .slot(SlotState::ACTIVE, id, 1, 5);
        // size field disagreeing with the layout
        let start = image.bytes.len();
        image
            .bytes
            .extend_from_slice(SlotHeader::new(SlotState::ACTIVE, id, 4, 8).as_bytes());
        image.bytes.resize(start + SLOT, 0xFF);
        // partial slot at the end is never read
        image.bytes.extend_from_slice(&[0xAA; SLOT - 1]);

        let snapshot = scan(&image.bytes, &registry, &config);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(value(&snapshot, 1), Some(5));
        assert!(snapshot.get("FlashItem", 3).is_none());
        assert!(snapshot.get("FlashItem", 4).is_none());
    }

    #[test]
    fn empty_image() {
        let (registry, _, config) = setup();
        assert!(scan(&[], &registry, &config).is_empty());
        assert!(scan(&[0xFF; SLOT], &registry, &config).is_empty());
    }
}
