//! Method bodies as they are stored in an image
//!
//! [0]: ECMA-335, Partition II, 25.4

use crate::binary_format::{pad_to, Deserialize, Serialize};
use crate::metadata::Token;
use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Method body as stored in the image: raw IL and exception clauses with byte offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    pub max_stack: u16,
    pub init_locals: bool,

    /// `StandAloneSig` token of the locals signature (null when there are no locals)
    pub local_var_sig: Token,

    pub code: Vec<u8>,
    pub clauses: Vec<RawClause>,
}

/// Exception clause with byte offsets
///
/// [0]: ECMA-335, Partition II, 25.4.6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawClause {
    pub kind: u16,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,

    /// Class token for catch clauses, filter offset for filter clauses, zero otherwise
    pub class_or_filter: u32,
}

impl RawClause {
    pub const CATCH: u16 = 0x0000;
    pub const FILTER: u16 = 0x0001;
    pub const FINALLY: u16 = 0x0002;
    pub const FAULT: u16 = 0x0004;

    fn fits_small_form(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_offset <= 0xFFFF
            && self.handler_length <= 0xFF
    }
}

const TINY_FORMAT: u8 = 0x02;
const FAT_FORMAT: u16 = 0x03;
const MORE_SECTS: u16 = 0x08;
const INIT_LOCALS: u16 = 0x10;

const SECT_EH_TABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

impl RawBody {
    /// Body with no locals and no exception clauses
    pub fn new(code: Vec<u8>) -> RawBody {
        RawBody {
            max_stack: 8,
            init_locals: false,
            local_var_sig: Token::NULL,
            code,
            clauses: vec![],
        }
    }

    /// Parse a body from the bytes starting at its RVA
    pub fn parse(bytes: &[u8]) -> Result<RawBody, Error> {
        let first = *bytes.first().ok_or_else(|| {
            Error::MalformedImage(String::from("method body is past the end of its section"))
        })?;
        if first & 0x03 == TINY_FORMAT {
            let len = (first >> 2) as usize;
            let code = bytes.get(1..1 + len).ok_or_else(truncated)?;
            return Ok(RawBody::new(code.to_vec()));
        }

        let mut reader = Cursor::new(bytes);
        let flags_and_size = u16::deserialize(&mut reader)?;
        if flags_and_size & 0x03 != FAT_FORMAT {
            return Err(Error::MalformedImage(format!(
                "method body header 0x{:02X} is neither tiny nor fat",
                first
            )));
        }
        let header_size = ((flags_and_size >> 12) as usize) * 4;
        let max_stack = u16::deserialize(&mut reader)?;
        let code_size = u32::deserialize(&mut reader)? as usize;
        let local_var_sig = Token(u32::deserialize(&mut reader)?);

        let code = header_size
            .checked_add(code_size)
            .and_then(|end| bytes.get(header_size..end))
            .ok_or_else(truncated)?
            .to_vec();

        let mut clauses = vec![];
        let mut more_sections = flags_and_size & MORE_SECTS != 0;
        let mut offset = header_size + code_size;
        while more_sections {
            offset = (offset + 3) & !3;
            let mut reader = Cursor::new(bytes.get(offset..).ok_or_else(truncated)?);
            let kind = reader.read_u8()?;
            let fat = kind & SECT_FAT_FORMAT != 0;
            let data_size = if fat {
                reader.read_u24::<LittleEndian>()? as usize
            } else {
                let size = reader.read_u8()? as usize;
                let _reserved = reader.read_u16::<LittleEndian>()?;
                size
            };
            if data_size < 4 {
                return Err(Error::MalformedImage(format!(
                    "method data section of {} bytes",
                    data_size
                )));
            }

            if kind & 0x3F == SECT_EH_TABLE {
                let clause_size = if fat { 24 } else { 12 };
                for _ in 0..(data_size - 4) / clause_size {
                    clauses.push(if fat {
                        RawClause {
                            kind: u32::deserialize(&mut reader)? as u16,
                            try_offset: u32::deserialize(&mut reader)?,
                            try_length: u32::deserialize(&mut reader)?,
                            handler_offset: u32::deserialize(&mut reader)?,
                            handler_length: u32::deserialize(&mut reader)?,
                            class_or_filter: u32::deserialize(&mut reader)?,
                        }
                    } else {
                        RawClause {
                            kind: u16::deserialize(&mut reader)?,
                            try_offset: u16::deserialize(&mut reader)? as u32,
                            try_length: u8::deserialize(&mut reader)? as u32,
                            handler_offset: u16::deserialize(&mut reader)? as u32,
                            handler_length: u8::deserialize(&mut reader)? as u32,
                            class_or_filter: u32::deserialize(&mut reader)?,
                        }
                    });
                }
            } else {
                log::debug!("Skipping method data section of kind 0x{:02X}", kind);
            }

            more_sections = kind & SECT_MORE_SECTS != 0;
            offset += data_size;
        }

        Ok(RawBody {
            max_stack,
            init_locals: flags_and_size & INIT_LOCALS != 0,
            local_var_sig,
            code,
            clauses,
        })
    }

    fn fits_tiny_form(&self) -> bool {
        self.code.len() < 64
            && self.max_stack <= 8
            && self.local_var_sig.is_null()
            && self.clauses.is_empty()
            && !self.init_locals
    }

    /// Encode the body, picking the smallest header and clause forms that fit
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        if self.fits_tiny_form() {
            bytes.push(((self.code.len() as u8) << 2) | TINY_FORMAT);
            bytes.extend_from_slice(&self.code);
            return Ok(bytes);
        }

        let mut flags = FAT_FORMAT | (3 << 12);
        if !self.clauses.is_empty() {
            flags |= MORE_SECTS;
        }
        if self.init_locals {
            flags |= INIT_LOCALS;
        }
        flags.serialize(&mut bytes)?;
        self.max_stack.serialize(&mut bytes)?;
        (self.code.len() as u32).serialize(&mut bytes)?;
        self.local_var_sig.0.serialize(&mut bytes)?;
        bytes.extend_from_slice(&self.code);

        if self.clauses.is_empty() {
            return Ok(bytes);
        }
        pad_to(&mut bytes, 4);

        let small_size = 4 + self.clauses.len() * 12;
        if small_size <= 0xFF && self.clauses.iter().all(RawClause::fits_small_form) {
            bytes.push(SECT_EH_TABLE);
            bytes.push(small_size as u8);
            0u16.serialize(&mut bytes)?;
            for clause in &self.clauses {
                clause.kind.serialize(&mut bytes)?;
                (clause.try_offset as u16).serialize(&mut bytes)?;
                (clause.try_length as u8).serialize(&mut bytes)?;
                (clause.handler_offset as u16).serialize(&mut bytes)?;
                (clause.handler_length as u8).serialize(&mut bytes)?;
                clause.class_or_filter.serialize(&mut bytes)?;
            }
        } else {
            let fat_size = 4 + self.clauses.len() * 24;
            if fat_size > 0xFF_FFFF {
                return Err(Error::CodeTooLarge(fat_size));
            }
            bytes.push(SECT_EH_TABLE | SECT_FAT_FORMAT);
            bytes.write_u24::<LittleEndian>(fat_size as u32)?;
            for clause in &self.clauses {
                (clause.kind as u32).serialize(&mut bytes)?;
                clause.try_offset.serialize(&mut bytes)?;
                clause.try_length.serialize(&mut bytes)?;
                clause.handler_offset.serialize(&mut bytes)?;
                clause.handler_length.serialize(&mut bytes)?;
                clause.class_or_filter.serialize(&mut bytes)?;
            }
        }
        Ok(bytes)
    }
}

fn truncated() -> Error {
    Error::MalformedImage(String::from("method body runs past the end of its section"))
}
