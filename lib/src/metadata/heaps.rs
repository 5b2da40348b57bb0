//! Metadata heaps
//!
//! Heaps are only ever appended to. Offsets handed out while an image was loaded stay valid when
//! it is written back, so rows and IL that weren't touched never need to be rewritten.

use crate::binary_format::{read_compressed_u32, write_compressed_u32};
use crate::Error;
use std::collections::HashMap;

/// `#Strings`: NUL-terminated UTF-8 identifiers
#[derive(Clone, PartialEq, Eq)]
pub struct StringHeap {
    bytes: Vec<u8>,
    lookup: HashMap<String, u32>,
}

impl StringHeap {
    pub fn new() -> StringHeap {
        StringHeap::from_bytes(vec![0])
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> StringHeap {
        if bytes.is_empty() {
            bytes.push(0);
        }
        let mut lookup = HashMap::new();
        let mut start = 0;
        for (idx, byte) in bytes.iter().enumerate() {
            if *byte == 0 {
                if let Ok(value) = std::str::from_utf8(&bytes[start..idx]) {
                    lookup.entry(value.to_owned()).or_insert(start as u32);
                }
                start = idx + 1;
            }
        }
        StringHeap { bytes, lookup }
    }

    pub fn get(&self, offset: u32) -> Result<String, Error> {
        let tail = self.bytes.get(offset as usize..).ok_or_else(|| {
            Error::MalformedImage(format!("string heap offset 0x{:X} is out of range", offset))
        })?;
        let len = tail.iter().position(|byte| *byte == 0).ok_or_else(|| {
            Error::MalformedImage(format!("string at 0x{:X} is not terminated", offset))
        })?;
        Ok(String::from_utf8(tail[..len].to_vec())?)
    }

    pub fn add(&mut self, value: &str) -> u32 {
        if let Some(offset) = self.lookup.get(value) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.lookup.insert(value.to_owned(), offset);
        offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// `#Blob`: length-prefixed byte strings (signatures, attribute values, sequence points)
#[derive(Clone, PartialEq, Eq)]
pub struct BlobHeap {
    bytes: Vec<u8>,
    lookup: HashMap<Vec<u8>, u32>,
}

impl BlobHeap {
    pub fn new() -> BlobHeap {
        BlobHeap::from_bytes(vec![0])
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> BlobHeap {
        if bytes.is_empty() {
            bytes.push(0);
        }
        let mut heap = BlobHeap {
            bytes,
            lookup: HashMap::new(),
        };
        let mut offset = 0;
        while offset < heap.bytes.len() {
            let mut reader = &heap.bytes[offset..];
            let len = match read_compressed_u32(&mut reader) {
                Ok(len) => len as usize,
                Err(_) => break,
            };
            let start = heap.bytes.len() - reader.len();
            let blob = match heap.bytes.get(start..start + len) {
                Some(blob) => blob.to_vec(),
                None => break,
            };
            heap.lookup.entry(blob).or_insert(offset as u32);
            offset = start + len;
        }
        heap
    }

    pub fn get(&self, offset: u32) -> Result<&[u8], Error> {
        let out_of_range =
            || Error::MalformedImage(format!("blob heap offset 0x{:X} is out of range", offset));
        let mut reader = self.bytes.get(offset as usize..).ok_or_else(out_of_range)?;
        let len = read_compressed_u32(&mut reader).map_err(|_| out_of_range())? as usize;
        reader.get(..len).ok_or_else(out_of_range)
    }

    pub fn add(&mut self, blob: &[u8]) -> Result<u32, Error> {
        if let Some(offset) = self.lookup.get(blob) {
            return Ok(*offset);
        }
        let offset = self.bytes.len() as u32;
        write_compressed_u32(&mut self.bytes, blob.len() as u32)?;
        self.bytes.extend_from_slice(blob);
        self.lookup.insert(blob.to_vec(), offset);
        Ok(offset)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// `#US`: string literals loaded by `ldstr`, as UTF-16 with a trailing flag byte
///
/// `ldstr` tokens carry the heap offset in their low 24 bits, so the heap can't grow past that.
#[derive(Clone, PartialEq, Eq)]
pub struct UserStringHeap {
    bytes: Vec<u8>,
    lookup: HashMap<String, u32>,
}

impl UserStringHeap {
    /// Largest offset an `ldstr` token can address
    pub const MAX_OFFSET: usize = 0x00FF_FFFF;

    pub fn new() -> UserStringHeap {
        UserStringHeap::from_bytes(vec![0])
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> UserStringHeap {
        if bytes.is_empty() {
            bytes.push(0);
        }
        let mut heap = UserStringHeap {
            bytes,
            lookup: HashMap::new(),
        };
        let mut offset = 1;
        while offset < heap.bytes.len() {
            let (value, next) = match heap.read(offset as u32) {
                Ok(found) => found,
                Err(_) => break,
            };
            heap.lookup.entry(value).or_insert(offset as u32);
            offset = next;
        }
        heap
    }

    /// String at an offset, along with the offset of the next entry
    fn read(&self, offset: u32) -> Result<(String, usize), Error> {
        let out_of_range = || {
            Error::MalformedImage(format!("user string offset 0x{:X} is out of range", offset))
        };
        let mut reader = self.bytes.get(offset as usize..).ok_or_else(out_of_range)?;
        let len = read_compressed_u32(&mut reader).map_err(|_| out_of_range())? as usize;
        let start = self.bytes.len() - reader.len();
        let data = reader.get(..len).ok_or_else(out_of_range)?;

        // The last byte is the flag byte, not part of the string
        let units: Vec<u16> = data[..len.saturating_sub(1)]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let value = String::from_utf16(&units).map_err(|_| {
            Error::MalformedImage(format!("user string at 0x{:X} is not valid UTF-16", offset))
        })?;
        Ok((value, start + len))
    }

    pub fn get(&self, offset: u32) -> Result<String, Error> {
        self.read(offset).map(|(value, _)| value)
    }

    /// Intern a literal, returning its heap offset
    pub fn add(&mut self, value: &str) -> Result<u32, Error> {
        if let Some(offset) = self.lookup.get(value) {
            return Ok(*offset);
        }

        let mut data: Vec<u8> = Vec::with_capacity(value.len() * 2 + 1);
        let mut special = false;
        for unit in value.encode_utf16() {
            special |= needs_flag(unit);
            data.extend_from_slice(&unit.to_le_bytes());
        }
        data.push(special as u8);

        let offset = self.bytes.len();
        if offset > Self::MAX_OFFSET {
            return Err(Error::HeapFull {
                heap: "#US",
                size: offset,
            });
        }
        write_compressed_u32(&mut self.bytes, data.len() as u32)?;
        self.bytes.extend_from_slice(&data);
        self.lookup.insert(value.to_owned(), offset as u32);
        Ok(offset as u32)
    }

    /// Offset of a literal that is already in the heap
    pub fn find(&self, value: &str) -> Option<u32> {
        self.lookup.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Does this UTF-16 code unit set the trailing flag byte of a user string?
///
/// [0]: ECMA-335, Partition II, 24.2.4
fn needs_flag(unit: u16) -> bool {
    unit > 0xFF || matches!(unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
}

/// `#GUID`: 16-byte entries, addressed by 1-based index
#[derive(Clone, PartialEq, Eq)]
pub struct GuidHeap {
    bytes: Vec<u8>,
}

impl GuidHeap {
    pub fn new() -> GuidHeap {
        GuidHeap { bytes: vec![] }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> GuidHeap {
        GuidHeap { bytes }
    }

    /// Entry at a 1-based index (`0` is the null GUID)
    pub fn get(&self, index: u32) -> Result<[u8; 16], Error> {
        if index == 0 {
            return Ok([0; 16]);
        }
        let start = (index as usize - 1) * 16;
        let mut guid = [0; 16];
        guid.copy_from_slice(self.bytes.get(start..start + 16).ok_or_else(|| {
            Error::MalformedImage(format!("GUID index {} is out of range", index))
        })?);
        Ok(guid)
    }

    pub fn add(&mut self, guid: [u8; 16]) -> u32 {
        let existing = self
            .bytes
            .chunks_exact(16)
            .position(|entry| entry == guid);
        match existing {
            Some(idx) => idx as u32 + 1,
            None => {
                self.bytes.extend_from_slice(&guid);
                (self.bytes.len() / 16) as u32
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

macro_rules! heap_debug {
    ($($heap:ident),*) => {
        $(
            impl std::fmt::Debug for $heap {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}({} bytes)", stringify!($heap), self.bytes.len())
                }
            }
        )*
    };
}

heap_debug!(StringHeap, BlobHeap, UserStringHeap, GuidHeap);

macro_rules! heap_default {
    ($($heap:ident),*) => {
        $(
            impl Default for $heap {
                fn default() -> Self {
                    $heap::new()
                }
            }
        )*
    };
}

heap_default!(StringHeap, BlobHeap, UserStringHeap, GuidHeap);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strings_are_shared() {
        let mut heap = StringHeap::new();
        let update = heap.add("Update");
        assert_eq!(update, 1);
        assert_eq!(heap.add("Update"), update);
        assert_eq!(heap.add(""), 0);
        assert_eq!(heap.get(update).unwrap(), "Update");

        let reloaded = StringHeap::from_bytes(heap.as_bytes().to_vec());
        assert_eq!(reloaded.clone().add("Update"), update);
        assert!(reloaded.get(100).is_err());
    }

    #[test]
    fn user_strings_carry_a_flag_byte() {
        let mut heap = UserStringHeap::new();
        let label = heap.add("Profilator->Game.Player.Update").unwrap();
        assert_eq!(label, 1);
        // 30 UTF-16 units and a flag byte; the `-` sets the flag
        assert_eq!(heap.as_bytes()[1], 61);
        assert_eq!(heap.as_bytes()[62], 1);
        assert_eq!(heap.get(label).unwrap(), "Profilator->Game.Player.Update");

        let plain = heap.add("Update").unwrap();
        assert_eq!(*heap.as_bytes().last().unwrap(), 0);
        assert_eq!(heap.add("Update").unwrap(), plain);

        let reloaded = UserStringHeap::from_bytes(heap.as_bytes().to_vec());
        assert_eq!(reloaded.find("Update"), Some(plain));
    }

    #[test]
    fn user_string_heap_stops_at_the_token_limit() {
        let mut bytes = vec![0; UserStringHeap::MAX_OFFSET];
        // a single huge literal filling the heap up to the limit
        let filler_len = UserStringHeap::MAX_OFFSET - 5;
        bytes[1..5].copy_from_slice(&(0xC000_0000u32 | filler_len as u32).to_be_bytes());
        let mut heap = UserStringHeap::from_bytes(bytes);

        let last = heap.add("a").unwrap();
        assert_eq!(last as usize, UserStringHeap::MAX_OFFSET);
        match heap.add("b") {
            Err(Error::HeapFull { heap: "#US", size }) => {
                assert_eq!(size, UserStringHeap::MAX_OFFSET + 4)
            }
            other => panic!("expected a full heap error, got {:?}", other),
        }
        assert_eq!(heap.find("a"), Some(last));
    }

    #[test]
    fn blobs_and_guids() {
        let mut blobs = BlobHeap::new();
        let sig = blobs.add(&[0x00, 0x00, 0x01]).unwrap();
        assert_eq!(sig, 1);
        assert_eq!(blobs.get(sig).unwrap(), &[0x00, 0x00, 0x01]);
        assert_eq!(blobs.add(&[0x00, 0x00, 0x01]).unwrap(), sig);
        assert_eq!(blobs.get(0).unwrap(), &[] as &[u8]);

        let reloaded = BlobHeap::from_bytes(blobs.as_bytes().to_vec());
        assert_eq!(reloaded.clone().add(&[0x00, 0x00, 0x01]).unwrap(), sig);

        let mut guids = GuidHeap::new();
        let mvid = guids.add([7; 16]);
        assert_eq!(mvid, 1);
        assert_eq!(guids.add([7; 16]), 1);
        assert_eq!(guids.get(1).unwrap(), [7; 16]);
        assert_eq!(guids.get(0).unwrap(), [0; 16]);
        assert!(guids.get(2).is_err());
    }
}
