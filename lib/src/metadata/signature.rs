//! Signature blobs
//!
//! Signatures are parsed into a tree that keeps everything needed to write the same bytes back:
//! custom modifiers, calling conventions, array shapes, and so on.
//!
//! [0]: ECMA-335, Partition II, 23.2

use crate::binary_format::{
    read_compressed_i32, read_compressed_u32, write_compressed_i32, write_compressed_u32,
};
use crate::metadata::tables::ids;
use crate::metadata::Token;
use crate::Error;
use byteorder::ReadBytesExt;
use std::io;

/// Method signature (`MethodDefSig`, `MethodRefSig`, or the target of a function pointer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    /// Calling convention byte (including `HAS_THIS` and `GENERIC`)
    pub calling_convention: u8,

    /// Number of generic parameters, for generic methods
    pub generic_params: u32,

    pub return_type: TypeSig,

    /// Parameters (a [`TypeSig::Sentinel`] separates the fixed from the variadic ones)
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    pub const DEFAULT: u8 = 0x00;
    pub const VARARG: u8 = 0x05;
    pub const GENERIC: u8 = 0x10;
    pub const HAS_THIS: u8 = 0x20;
    pub const EXPLICIT_THIS: u8 = 0x40;

    /// Signature of a static method
    pub fn new(return_type: TypeSig, params: Vec<TypeSig>) -> MethodSig {
        MethodSig {
            calling_convention: MethodSig::DEFAULT,
            generic_params: 0,
            return_type,
            params,
        }
    }

    /// Signature of an instance method
    pub fn instance(return_type: TypeSig, params: Vec<TypeSig>) -> MethodSig {
        MethodSig {
            calling_convention: MethodSig::HAS_THIS,
            ..MethodSig::new(return_type, params)
        }
    }

    /// `void ()`
    pub fn nullary() -> MethodSig {
        MethodSig::new(TypeSig::Void, vec![])
    }

    pub fn has_this(&self) -> bool {
        self.calling_convention & MethodSig::HAS_THIS != 0
    }

    /// Number of declared parameters (not counting the vararg sentinel)
    pub fn param_count(&self) -> usize {
        self.params
            .iter()
            .filter(|param| **param != TypeSig::Sentinel)
            .count()
    }

    pub fn parse(blob: &[u8]) -> Result<MethodSig, Error> {
        let mut reader = blob;
        let signature = MethodSig::read(&mut reader)?;
        ensure_consumed(reader, "method")?;
        Ok(signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        self.write(&mut bytes)?;
        Ok(bytes)
    }

    fn read(reader: &mut &[u8]) -> Result<MethodSig, Error> {
        let calling_convention = reader.read_u8()?;
        if calling_convention & 0x0F > MethodSig::VARARG {
            return Err(Error::InvalidSignature(format!(
                "calling convention 0x{:02X} is not a method signature",
                calling_convention
            )));
        }
        let generic_params = if calling_convention & MethodSig::GENERIC != 0 {
            read_compressed_u32(reader)?
        } else {
            0
        };
        let count = read_compressed_u32(reader)?;
        let return_type = TypeSig::read(reader)?;
        let mut params = Vec::with_capacity(count as usize);
        let mut declared = 0;
        while declared < count {
            let param = TypeSig::read(reader)?;
            if param != TypeSig::Sentinel {
                declared += 1;
            }
            params.push(param);
        }
        Ok(MethodSig {
            calling_convention,
            generic_params,
            return_type,
            params,
        })
    }

    fn write(&self, bytes: &mut Vec<u8>) -> io::Result<()> {
        bytes.push(self.calling_convention);
        if self.calling_convention & MethodSig::GENERIC != 0 {
            write_compressed_u32(bytes, self.generic_params)?;
        }
        write_compressed_u32(bytes, self.param_count() as u32)?;
        self.return_type.write(bytes)?;
        for param in &self.params {
            param.write(bytes)?;
        }
        Ok(())
    }
}

/// Signature of a member reference: either a method or a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSig {
    Method(MethodSig),
    Field(TypeSig),
}

impl MemberSig {
    const FIELD: u8 = 0x06;

    pub fn parse(blob: &[u8]) -> Result<MemberSig, Error> {
        match blob.first() {
            Some(&MemberSig::FIELD) => {
                let mut reader = &blob[1..];
                let field = TypeSig::read(&mut reader)?;
                ensure_consumed(reader, "field")?;
                Ok(MemberSig::Field(field))
            }
            _ => MethodSig::parse(blob).map(MemberSig::Method),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            MemberSig::Method(method) => method.to_bytes(),
            MemberSig::Field(field) => {
                let mut bytes = vec![MemberSig::FIELD];
                field.write(&mut bytes)?;
                Ok(bytes)
            }
        }
    }

    pub fn as_method(&self) -> Option<&MethodSig> {
        match self {
            MemberSig::Method(method) => Some(method),
            MemberSig::Field(_) => None,
        }
    }
}

impl From<MethodSig> for MemberSig {
    fn from(method: MethodSig) -> MemberSig {
        MemberSig::Method(method)
    }
}

/// Type in a signature
///
/// Class and value type tokens point into the `TypeDef`, `TypeRef`, or `TypeSpec` tables.
///
/// [0]: ECMA-335, Partition II, 23.1.16
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Object,
    IntPtr,
    UIntPtr,
    TypedByRef,
    Class(Token),
    ValueType(Token),
    SzArray(Box<TypeSig>),
    Array(Box<TypeSig>, ArrayShape),
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    Pinned(Box<TypeSig>),
    FnPtr(Box<MethodSig>),
    GenericInst {
        value_type: bool,
        generic: Token,
        args: Vec<TypeSig>,
    },
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the enclosing method
    MVar(u32),
    Modified {
        required: bool,
        modifier: Token,
        inner: Box<TypeSig>,
    },
    Sentinel,
}

/// Rank and bounds of a general array
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArrayShape {
    pub rank: u32,
    pub sizes: Vec<u32>,
    pub lower_bounds: Vec<i32>,
}

impl TypeSig {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1B;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const MVAR: u8 = 0x1E;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;

    /// Parse a standalone type (the contents of a `TypeSpec` blob)
    pub fn parse(blob: &[u8]) -> Result<TypeSig, Error> {
        let mut reader = blob;
        let sig = TypeSig::read(&mut reader)?;
        ensure_consumed(reader, "type")?;
        Ok(sig)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        self.write(&mut bytes)?;
        Ok(bytes)
    }

    fn read(reader: &mut &[u8]) -> Result<TypeSig, Error> {
        let boxed = |reader: &mut &[u8]| TypeSig::read(reader).map(Box::new);
        Ok(match reader.read_u8()? {
            TypeSig::VOID => TypeSig::Void,
            TypeSig::BOOLEAN => TypeSig::Boolean,
            TypeSig::CHAR => TypeSig::Char,
            TypeSig::I1 => TypeSig::Int8,
            TypeSig::U1 => TypeSig::UInt8,
            TypeSig::I2 => TypeSig::Int16,
            TypeSig::U2 => TypeSig::UInt16,
            TypeSig::I4 => TypeSig::Int32,
            TypeSig::U4 => TypeSig::UInt32,
            TypeSig::I8 => TypeSig::Int64,
            TypeSig::U8 => TypeSig::UInt64,
            TypeSig::R4 => TypeSig::Float32,
            TypeSig::R8 => TypeSig::Float64,
            TypeSig::STRING => TypeSig::String,
            TypeSig::OBJECT => TypeSig::Object,
            TypeSig::I => TypeSig::IntPtr,
            TypeSig::U => TypeSig::UIntPtr,
            TypeSig::TYPEDBYREF => TypeSig::TypedByRef,
            TypeSig::SENTINEL => TypeSig::Sentinel,
            TypeSig::CLASS => TypeSig::Class(read_type_token(reader)?),
            TypeSig::VALUETYPE => TypeSig::ValueType(read_type_token(reader)?),
            TypeSig::SZARRAY => TypeSig::SzArray(boxed(reader)?),
            TypeSig::PTR => TypeSig::Ptr(boxed(reader)?),
            TypeSig::BYREF => TypeSig::ByRef(boxed(reader)?),
            TypeSig::PINNED => TypeSig::Pinned(boxed(reader)?),
            TypeSig::FNPTR => TypeSig::FnPtr(Box::new(MethodSig::read(reader)?)),
            TypeSig::VAR => TypeSig::Var(read_compressed_u32(reader)?),
            TypeSig::MVAR => TypeSig::MVar(read_compressed_u32(reader)?),
            TypeSig::ARRAY => {
                let element = boxed(reader)?;
                let rank = read_compressed_u32(reader)?;
                let sizes = (0..read_compressed_u32(reader)?)
                    .map(|_| read_compressed_u32(reader))
                    .collect::<Result<_, _>>()?;
                let lower_bounds = (0..read_compressed_u32(reader)?)
                    .map(|_| read_compressed_i32(reader))
                    .collect::<Result<_, _>>()?;
                TypeSig::Array(
                    element,
                    ArrayShape {
                        rank,
                        sizes,
                        lower_bounds,
                    },
                )
            }
            TypeSig::GENERICINST => {
                let value_type = match reader.read_u8()? {
                    TypeSig::CLASS => false,
                    TypeSig::VALUETYPE => true,
                    other => {
                        return Err(Error::InvalidSignature(format!(
                            "generic instantiation of element type 0x{:02X}",
                            other
                        )))
                    }
                };
                let generic = read_type_token(reader)?;
                let args = (0..read_compressed_u32(reader)?)
                    .map(|_| TypeSig::read(reader))
                    .collect::<Result<_, _>>()?;
                TypeSig::GenericInst {
                    value_type,
                    generic,
                    args,
                }
            }
            tag @ (TypeSig::CMOD_REQD | TypeSig::CMOD_OPT) => TypeSig::Modified {
                required: tag == TypeSig::CMOD_REQD,
                modifier: read_type_token(reader)?,
                inner: boxed(reader)?,
            },
            other => {
                return Err(Error::InvalidSignature(format!(
                    "unknown element type 0x{:02X}",
                    other
                )))
            }
        })
    }

    fn write(&self, bytes: &mut Vec<u8>) -> io::Result<()> {
        let simple = match self {
            TypeSig::Void => Some(TypeSig::VOID),
            TypeSig::Boolean => Some(TypeSig::BOOLEAN),
            TypeSig::Char => Some(TypeSig::CHAR),
            TypeSig::Int8 => Some(TypeSig::I1),
            TypeSig::UInt8 => Some(TypeSig::U1),
            TypeSig::Int16 => Some(TypeSig::I2),
            TypeSig::UInt16 => Some(TypeSig::U2),
            TypeSig::Int32 => Some(TypeSig::I4),
            TypeSig::UInt32 => Some(TypeSig::U4),
            TypeSig::Int64 => Some(TypeSig::I8),
            TypeSig::UInt64 => Some(TypeSig::U8),
            TypeSig::Float32 => Some(TypeSig::R4),
            TypeSig::Float64 => Some(TypeSig::R8),
            TypeSig::String => Some(TypeSig::STRING),
            TypeSig::Object => Some(TypeSig::OBJECT),
            TypeSig::IntPtr => Some(TypeSig::I),
            TypeSig::UIntPtr => Some(TypeSig::U),
            TypeSig::TypedByRef => Some(TypeSig::TYPEDBYREF),
            TypeSig::Sentinel => Some(TypeSig::SENTINEL),
            _ => None,
        };
        if let Some(tag) = simple {
            bytes.push(tag);
            return Ok(());
        }

        match self {
            TypeSig::Class(token) => {
                bytes.push(TypeSig::CLASS);
                write_type_token(bytes, *token)
            }
            TypeSig::ValueType(token) => {
                bytes.push(TypeSig::VALUETYPE);
                write_type_token(bytes, *token)
            }
            TypeSig::SzArray(element) => {
                bytes.push(TypeSig::SZARRAY);
                element.write(bytes)
            }
            TypeSig::Ptr(inner) => {
                bytes.push(TypeSig::PTR);
                inner.write(bytes)
            }
            TypeSig::ByRef(inner) => {
                bytes.push(TypeSig::BYREF);
                inner.write(bytes)
            }
            TypeSig::Pinned(inner) => {
                bytes.push(TypeSig::PINNED);
                inner.write(bytes)
            }
            TypeSig::FnPtr(method) => {
                bytes.push(TypeSig::FNPTR);
                method.write(bytes)
            }
            TypeSig::Var(number) => {
                bytes.push(TypeSig::VAR);
                write_compressed_u32(bytes, *number)
            }
            TypeSig::MVar(number) => {
                bytes.push(TypeSig::MVAR);
                write_compressed_u32(bytes, *number)
            }
            TypeSig::Array(element, shape) => {
                bytes.push(TypeSig::ARRAY);
                element.write(bytes)?;
                write_compressed_u32(bytes, shape.rank)?;
                write_compressed_u32(bytes, shape.sizes.len() as u32)?;
                for size in &shape.sizes {
                    write_compressed_u32(bytes, *size)?;
                }
                write_compressed_u32(bytes, shape.lower_bounds.len() as u32)?;
                for bound in &shape.lower_bounds {
                    write_compressed_i32(bytes, *bound)?;
                }
                Ok(())
            }
            TypeSig::GenericInst {
                value_type,
                generic,
                args,
            } => {
                bytes.push(TypeSig::GENERICINST);
                bytes.push(if *value_type {
                    TypeSig::VALUETYPE
                } else {
                    TypeSig::CLASS
                });
                write_type_token(bytes, *generic)?;
                write_compressed_u32(bytes, args.len() as u32)?;
                for arg in args {
                    arg.write(bytes)?;
                }
                Ok(())
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                bytes.push(if *required {
                    TypeSig::CMOD_REQD
                } else {
                    TypeSig::CMOD_OPT
                });
                write_type_token(bytes, *modifier)?;
                inner.write(bytes)
            }
            _ => unreachable!("simple element types are written above"),
        }
    }
}

/// `TypeDefOrRefOrSpecEncoded` (ECMA-335, Partition II, 23.2.8)
fn read_type_token(reader: &mut &[u8]) -> Result<Token, Error> {
    let coded = read_compressed_u32(reader)?;
    let table = match coded & 0b11 {
        0 => ids::TYPE_DEF,
        1 => ids::TYPE_REF,
        2 => ids::TYPE_SPEC,
        _ => {
            return Err(Error::InvalidSignature(format!(
                "type token 0x{:X} has an invalid tag",
                coded
            )))
        }
    };
    Ok(Token::from_parts(table, coded >> 2))
}

fn write_type_token(bytes: &mut Vec<u8>, token: Token) -> io::Result<()> {
    let tag = match token.table_id() {
        ids::TYPE_DEF => 0,
        ids::TYPE_REF => 1,
        ids::TYPE_SPEC => 2,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} can't appear in a signature", token),
            ))
        }
    };
    write_compressed_u32(bytes, (token.row() << 2) | tag)
}

fn ensure_consumed(rest: &[u8], what: &str) -> Result<(), Error> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidSignature(format!(
            "{} trailing byte(s) after a {} signature",
            rest.len(),
            what
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_signatures() {
        // instance void (string, int32[])
        let blob = [0x20, 0x02, 0x01, 0x0E, 0x1D, 0x08];
        let sig = MethodSig::parse(&blob).unwrap();
        assert_eq!(
            sig,
            MethodSig::instance(
                TypeSig::Void,
                vec![TypeSig::String, TypeSig::SzArray(Box::new(TypeSig::Int32))]
            )
        );
        assert_eq!(sig.to_bytes().unwrap(), blob);
        assert!(MethodSig::parse(&blob[..5]).is_err());
    }

    #[test]
    fn generics_and_modifiers_are_kept() {
        // instance generic<1> !!0& (class List`1<!0>) ...
        let blob = [
            0x30, 0x01, 0x01, 0x10, 0x1E, 0x00, 0x15, 0x12, 0x09, 0x01, 0x13, 0x00, 0x41,
        ];
        let sig = MethodSig::parse(&blob);
        // one declared parameter, so the sentinel is left over
        assert!(matches!(sig, Err(Error::InvalidSignature(_))));

        let blob = [
            0x25, 0x02, 0x01, 0x15, 0x12, 0x09, 0x01, 0x13, 0x00, 0x41, 0x1F, 0x0D, 0x08,
        ];
        let sig = MethodSig::parse(&blob).unwrap();
        assert_eq!(sig.calling_convention, MethodSig::HAS_THIS | MethodSig::VARARG);
        assert_eq!(sig.param_count(), 2);
        assert_eq!(
            sig.params[2],
            TypeSig::Modified {
                required: true,
                modifier: Token(0x0100_0003),
                inner: Box::new(TypeSig::Int32),
            }
        );
        assert_eq!(
            sig.params[0],
            TypeSig::GenericInst {
                value_type: false,
                generic: Token(0x0100_0002),
                args: vec![TypeSig::Var(0)],
            }
        );
        assert_eq!(sig.to_bytes().unwrap(), blob);
    }

    #[test]
    fn arrays_and_fields() {
        // field float64[0..., 2]
        let blob = [0x06, 0x14, 0x0D, 0x02, 0x01, 0x03, 0x01, 0x00];
        let sig = MemberSig::parse(&blob).unwrap();
        assert_eq!(
            sig,
            MemberSig::Field(TypeSig::Array(
                Box::new(TypeSig::Float64),
                ArrayShape {
                    rank: 2,
                    sizes: vec![3],
                    lower_bounds: vec![0],
                }
            ))
        );
        assert_eq!(sig.to_bytes().unwrap(), blob);
        assert!(sig.as_method().is_none());
    }

    #[test]
    fn bad_element_types() {
        assert!(matches!(
            TypeSig::parse(&[0x51]),
            Err(Error::InvalidSignature(_))
        ));
        assert!(matches!(
            TypeSig::parse(&[0x12, 0x03]),
            Err(Error::InvalidSignature(_))
        ));
        assert!(TypeSig::Class(Token(0x0A00_0001)).to_bytes().is_err());
    }
}
