//! Segment layout and type registry.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Header: magic, version, type count, length, generation, ctime │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Descriptor table: {type, elem size, capacity, offset} × count │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Block for the lowest type id: capacity × [slot hdr | payload] │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Block for the next type id ...                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The layout is computed once at process start from device limits. A
//! process that attaches to an existing segment recomputes it and refuses
//! the segment unless both agree field for field.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ArenaError, ArenaResult};
use crate::slot::SLOT_HEADER_LEN;

/// Magic number at offset 0 of every segment ("SONICSHM").
pub const SEGMENT_MAGIC: u64 = 0x534f_4e49_4353_484d;

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Maximum number of object types one segment can register.
pub const MAX_OBJECT_TYPES: usize = 32;

/// Fixed size of the segment header in bytes.
pub const HEADER_LEN: usize = 40;

/// Size of one descriptor table entry in bytes.
pub const DESCRIPTOR_LEN: usize = 24;

const GENERATION_OFFSET: usize = 24;
const SLOT_ALIGN: usize = 8;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Identifier of a declared object type. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectType(u16);

impl ObjectType {
    /// Creates an object type. Panics on 0, which is meant for constants.
    pub const fn new(id: u16) -> Self {
        assert!(id != 0, "object type 0 is reserved");
        Self(id)
    }

    pub fn from_raw(id: u16) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type {}", self.0)
    }
}

/// External identity of a stored object: its type, slot number and the
/// slot's reuse generation.
///
/// Packs into a `u64` as `type << 48 | generation << 32 | slot`, which is
/// what callers outside the arena hold as an opaque handle. Freeing a slot
/// bumps its generation, so a handle kept past `free` never matches the
/// slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex {
    object_type: ObjectType,
    slot: u32,
    generation: u16,
}

impl ArenaIndex {
    pub const fn new(object_type: ObjectType, slot: u32) -> Self {
        Self {
            object_type,
            slot,
            generation: 0,
        }
    }

    pub const fn with_generation(self, generation: u16) -> Self {
        Self { generation, ..self }
    }

    pub const fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub const fn slot(&self) -> u32 {
        self.slot
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }

    pub const fn to_raw(&self) -> u64 {
        ((self.object_type.0 as u64) << 48) | ((self.generation as u64) << 32) | self.slot as u64
    }

    /// Unpacks a handle. Rejects a zero type.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let object_type = ObjectType::from_raw((raw >> 48) as u16)?;
        Some(Self {
            object_type,
            slot: raw as u32,
            generation: (raw >> 32) as u16,
        })
    }
}

impl fmt::Display for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.slot)?;
        if self.generation != 0 {
            write!(f, "#{}", self.generation)?;
        }
        Ok(())
    }
}

/// Per-type region descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub object_type: ObjectType,
    /// Name used in logs only; not stored in the segment.
    pub name: &'static str,
    /// Payload size of one element in bytes.
    pub elem_size: u32,
    pub capacity: u32,
    /// Byte offset of the type's block inside the segment.
    pub offset: u64,
}

impl TypeDescriptor {
    /// Distance between consecutive slots.
    pub fn stride(&self) -> usize {
        SLOT_HEADER_LEN + align_up(self.elem_size as usize, SLOT_ALIGN)
    }

    pub fn block_len(&self) -> usize {
        self.stride() * self.capacity as usize
    }

    pub fn slot_offset(&self, slot: u32) -> usize {
        self.offset as usize + self.stride() * slot as usize
    }
}

/// Descriptor as read back from a segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor {
    pub object_type: u16,
    pub elem_size: u32,
    pub capacity: u32,
    pub offset: u64,
}

/// Decoded segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u64,
    pub version: u32,
    pub total_len: u64,
    /// Number of warm attaches since the segment was created.
    pub generation: u64,
    /// Creation time, unix seconds.
    pub created_at: u64,
    pub descriptors: Vec<RawDescriptor>,
}

impl SegmentHeader {
    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut r = bytes;
        let magic = r.read_u64::<LittleEndian>()?;
        let version = r.read_u32::<LittleEndian>()?;
        let count = r.read_u32::<LittleEndian>()? as usize;
        let total_len = r.read_u64::<LittleEndian>()?;
        let generation = r.read_u64::<LittleEndian>()?;
        let created_at = r.read_u64::<LittleEndian>()?;

        if count > MAX_OBJECT_TYPES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("descriptor count {} exceeds {}", count, MAX_OBJECT_TYPES),
            ));
        }

        let mut descriptors = Vec::with_capacity(count);
        for _ in 0..count {
            let object_type = r.read_u16::<LittleEndian>()?;
            let _reserved = r.read_u16::<LittleEndian>()?;
            let elem_size = r.read_u32::<LittleEndian>()?;
            let capacity = r.read_u32::<LittleEndian>()?;
            let _reserved = r.read_u32::<LittleEndian>()?;
            let offset = r.read_u64::<LittleEndian>()?;
            descriptors.push(RawDescriptor {
                object_type,
                elem_size,
                capacity,
                offset,
            });
        }

        Ok(Self {
            magic,
            version,
            total_len,
            generation,
            created_at,
            descriptors,
        })
    }
}

/// Complete segment geometry: descriptor per registered type, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    descriptors: Vec<TypeDescriptor>,
    total_len: usize,
}

impl SegmentLayout {
    pub fn builder() -> SegmentLayoutBuilder {
        SegmentLayoutBuilder::default()
    }

    pub fn descriptor(&self, object_type: ObjectType) -> Option<&TypeDescriptor> {
        self.descriptors
            .binary_search_by_key(&object_type, |d| d.object_type)
            .ok()
            .map(|i| &self.descriptors[i])
    }

    pub fn descriptors(&self) -> &[TypeDescriptor] {
        &self.descriptors
    }

    /// Total segment size in bytes.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Writes header and descriptor table to the front of `buf`.
    pub(crate) fn encode_header(
        &self,
        buf: &mut [u8],
        generation: u64,
        created_at: u64,
    ) -> io::Result<()> {
        let mut w = buf;
        w.write_u64::<LittleEndian>(SEGMENT_MAGIC)?;
        w.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        w.write_u32::<LittleEndian>(self.descriptors.len() as u32)?;
        w.write_u64::<LittleEndian>(self.total_len as u64)?;
        w.write_u64::<LittleEndian>(generation)?;
        w.write_u64::<LittleEndian>(created_at)?;

        for desc in &self.descriptors {
            w.write_u16::<LittleEndian>(desc.object_type.as_raw())?;
            w.write_u16::<LittleEndian>(0)?;
            w.write_u32::<LittleEndian>(desc.elem_size)?;
            w.write_u32::<LittleEndian>(desc.capacity)?;
            w.write_u32::<LittleEndian>(0)?;
            w.write_u64::<LittleEndian>(desc.offset)?;
        }
        Ok(())
    }

    pub(crate) fn write_generation(buf: &mut [u8], generation: u64) -> io::Result<()> {
        let mut w = &mut buf[GENERATION_OFFSET..GENERATION_OFFSET + 8];
        w.write_u64::<LittleEndian>(generation)
    }

    /// Checks that a header read from an existing segment describes exactly
    /// this layout.
    pub fn check_matches(&self, header: &SegmentHeader) -> Result<(), String> {
        if header.magic != SEGMENT_MAGIC {
            return Err(format!("bad magic 0x{:016x}", header.magic));
        }
        if header.version != SEGMENT_VERSION {
            return Err(format!("unsupported version {}", header.version));
        }
        if header.total_len != self.total_len as u64 {
            return Err(format!(
                "segment length {} differs from layout length {}",
                header.total_len, self.total_len
            ));
        }
        if header.descriptors.len() != self.descriptors.len() {
            return Err(format!(
                "segment registers {} types, layout registers {}",
                header.descriptors.len(),
                self.descriptors.len()
            ));
        }
        for (stored, wanted) in header.descriptors.iter().zip(&self.descriptors) {
            let expected = RawDescriptor {
                object_type: wanted.object_type.as_raw(),
                elem_size: wanted.elem_size,
                capacity: wanted.capacity,
                offset: wanted.offset,
            };
            if *stored != expected {
                return Err(format!(
                    "{} ({}): stored {:?}, wanted {:?}",
                    wanted.object_type, wanted.name, stored, expected
                ));
            }
        }
        Ok(())
    }
}

/// Collects type registrations and computes block offsets.
#[derive(Debug, Default)]
pub struct SegmentLayoutBuilder {
    entries: Vec<(ObjectType, &'static str, usize, u32)>,
}

impl SegmentLayoutBuilder {
    /// Registers a type with its payload size and element capacity.
    pub fn register(
        mut self,
        object_type: ObjectType,
        name: &'static str,
        elem_size: usize,
        capacity: u32,
    ) -> Self {
        self.entries.push((object_type, name, elem_size, capacity));
        self
    }

    pub fn build(self) -> ArenaResult<SegmentLayout> {
        if self.entries.is_empty() {
            return Err(ArenaError::Layout("no object types registered".to_string()));
        }
        if self.entries.len() > MAX_OBJECT_TYPES {
            return Err(ArenaError::Layout(format!(
                "{} object types registered, at most {} supported",
                self.entries.len(),
                MAX_OBJECT_TYPES
            )));
        }

        let mut sorted = BTreeMap::new();
        for (object_type, name, elem_size, capacity) in self.entries {
            if capacity == 0 {
                return Err(ArenaError::Layout(format!(
                    "{} ({}) has zero capacity",
                    object_type, name
                )));
            }
            if elem_size == 0 || elem_size > u32::MAX as usize {
                return Err(ArenaError::Layout(format!(
                    "{} ({}) has invalid element size {}",
                    object_type, name, elem_size
                )));
            }
            if sorted
                .insert(object_type, (name, elem_size as u32, capacity))
                .is_some()
            {
                return Err(ArenaError::Layout(format!(
                    "{} ({}) registered twice",
                    object_type, name
                )));
            }
        }

        let table_end = HEADER_LEN + DESCRIPTOR_LEN * sorted.len();
        let mut offset = align_up(table_end, SLOT_ALIGN);
        let mut descriptors = Vec::with_capacity(sorted.len());
        for (object_type, (name, elem_size, capacity)) in sorted {
            let desc = TypeDescriptor {
                object_type,
                name,
                elem_size,
                capacity,
                offset: offset as u64,
            };
            offset = offset
                .checked_add(desc.block_len())
                .ok_or_else(|| ArenaError::Layout(format!("{} ({}) overflows", object_type, name)))?;
            descriptors.push(desc);
        }

        Ok(SegmentLayout {
            descriptors,
            total_len: offset,
        })
    }
}
