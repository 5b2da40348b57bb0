use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Utility trait for serializing the fixed-size parts of PE images and CLI metadata
///
/// Everything in a PE/CLI image is little-endian. Variable-sized data lives in metadata heaps
/// and is addressed by offset, except for the compressed integers that signatures, blob
/// lengths, and sequence point records are made of (see [`read_compressed_u32`]).
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()>;
}

/// Counterpart to [`Serialize`]
pub trait Deserialize: Sized {
    /// Deserialize construct from a binary input stream
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, Error>;
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(*self)
    }
}

impl Serialize for u64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(*self)
    }
}

impl Deserialize for u8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u8()?)
    }
}

impl Deserialize for u16 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u16::<LittleEndian>()?)
    }
}

impl Deserialize for u32 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u32::<LittleEndian>()?)
    }
}

impl Deserialize for u64 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u64::<LittleEndian>()?)
    }
}

/// Largest value a compressed unsigned integer can hold
pub const MAX_COMPRESSED: u32 = 0x1FFF_FFFF;

/// Read an unsigned integer in the 1, 2, or 4 byte compressed form
///
/// [0]: ECMA-335, Partition II, 23.2
pub fn read_compressed_u32<R: ReadBytesExt>(reader: &mut R) -> Result<u32, Error> {
    let first = reader.read_u8()? as u32;
    if first & 0x80 == 0 {
        Ok(first)
    } else if first & 0xC0 == 0x80 {
        Ok(((first & 0x3F) << 8) | reader.read_u8()? as u32)
    } else if first & 0xE0 == 0xC0 {
        let rest = reader.read_u24::<byteorder::BigEndian>()?;
        Ok(((first & 0x1F) << 24) | rest)
    } else {
        Err(Error::InvalidSignature(format!(
            "0x{:02X} does not start a compressed integer",
            first
        )))
    }
}

pub fn write_compressed_u32<W: WriteBytesExt>(writer: &mut W, value: u32) -> io::Result<()> {
    if value < 0x80 {
        writer.write_u8(value as u8)
    } else if value < 0x4000 {
        writer.write_u16::<byteorder::BigEndian>(0x8000 | value as u16)
    } else if value <= MAX_COMPRESSED {
        writer.write_u32::<byteorder::BigEndian>(0xC000_0000 | value)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not fit in a compressed integer", value),
        ))
    }
}

/// Read a signed compressed integer (the sign bit is rotated into the lowest bit)
pub fn read_compressed_i32<R: ReadBytesExt>(reader: &mut R) -> Result<i32, Error> {
    let first = reader.read_u8()? as u32;
    let (raw, bits) = if first & 0x80 == 0 {
        (first, 7)
    } else if first & 0xC0 == 0x80 {
        (((first & 0x3F) << 8) | reader.read_u8()? as u32, 14)
    } else if first & 0xE0 == 0xC0 {
        let rest = reader.read_u24::<byteorder::BigEndian>()?;
        (((first & 0x1F) << 24) | rest, 29)
    } else {
        return Err(Error::InvalidSignature(format!(
            "0x{:02X} does not start a compressed integer",
            first
        )));
    };
    let magnitude = (raw >> 1) as i32;
    Ok(if raw & 1 == 0 {
        magnitude
    } else {
        magnitude - (1 << (bits - 1))
    })
}

pub fn write_compressed_i32<W: WriteBytesExt>(writer: &mut W, value: i32) -> io::Result<()> {
    let rotate = |bits: u32| -> u32 {
        let mask = (1u32 << bits) - 1;
        (((value as u32) << 1) & mask) | (value < 0) as u32
    };
    if (-0x40..0x40).contains(&value) {
        writer.write_u8(rotate(7) as u8)
    } else if (-0x2000..0x2000).contains(&value) {
        writer.write_u16::<byteorder::BigEndian>(0x8000 | rotate(14) as u16)
    } else if (-0x1000_0000..0x1000_0000).contains(&value) {
        writer.write_u32::<byteorder::BigEndian>(0xC000_0000 | rotate(29))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not fit in a signed compressed integer", value),
        ))
    }
}

/// Check the magic bytes at the front of a structure
pub fn expect_magic<R: ReadBytesExt>(reader: &mut R, expected: &'static [u8]) -> Result<(), Error> {
    let mut found = vec![0; expected.len()];
    reader.read_exact(&mut found)?;
    if found != expected {
        return Err(Error::BadMagic { expected, found });
    }
    Ok(())
}

/// Round `value` up to a multiple of `alignment` (a power of two)
pub fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Pad a buffer with zeros until its length is a multiple of `alignment`
pub fn pad_to(bytes: &mut Vec<u8>, alignment: usize) {
    while bytes.len() % alignment != 0 {
        bytes.push(0);
    }
}

/// Copy of `bytes` padded with zeros to a multiple of `alignment`
pub fn padded(bytes: &[u8], alignment: usize) -> Vec<u8> {
    let mut bytes = bytes.to_vec();
    pad_to(&mut bytes, alignment);
    bytes
}

/// Bounds-checked sub-slice, for offsets and sizes read out of a file
pub fn slice_at<'a>(bytes: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8], Error> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| {
            Error::MalformedImage(format!(
                "{} at 0x{:X} (+{}) is past the end of the data ({} bytes)",
                what,
                offset,
                len,
                bytes.len()
            ))
        })
}
