//! The `#~` stream: metadata tables
//!
//! Rows are kept as plain column values. Index columns are 2 or 4 bytes wide depending on how
//! many rows the tables they point into have, so widths are worked out from the row counts
//! every time the stream is read or written rather than being remembered from the input.
//!
//! [0]: ECMA-335, Partition II, 22 and 24.2.6

use crate::binary_format::{Deserialize, Serialize};
use crate::metadata::Token;
use crate::Error;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// Table numbers (also the top byte of tokens into that table)
pub mod ids {
    pub const MODULE: u8 = 0x00;
    pub const TYPE_REF: u8 = 0x01;
    pub const TYPE_DEF: u8 = 0x02;
    pub const FIELD_PTR: u8 = 0x03;
    pub const FIELD: u8 = 0x04;
    pub const METHOD_PTR: u8 = 0x05;
    pub const METHOD_DEF: u8 = 0x06;
    pub const PARAM_PTR: u8 = 0x07;
    pub const PARAM: u8 = 0x08;
    pub const INTERFACE_IMPL: u8 = 0x09;
    pub const MEMBER_REF: u8 = 0x0A;
    pub const CONSTANT: u8 = 0x0B;
    pub const CUSTOM_ATTRIBUTE: u8 = 0x0C;
    pub const FIELD_MARSHAL: u8 = 0x0D;
    pub const DECL_SECURITY: u8 = 0x0E;
    pub const CLASS_LAYOUT: u8 = 0x0F;
    pub const FIELD_LAYOUT: u8 = 0x10;
    pub const STAND_ALONE_SIG: u8 = 0x11;
    pub const EVENT_MAP: u8 = 0x12;
    pub const EVENT_PTR: u8 = 0x13;
    pub const EVENT: u8 = 0x14;
    pub const PROPERTY_MAP: u8 = 0x15;
    pub const PROPERTY_PTR: u8 = 0x16;
    pub const PROPERTY: u8 = 0x17;
    pub const METHOD_SEMANTICS: u8 = 0x18;
    pub const METHOD_IMPL: u8 = 0x19;
    pub const MODULE_REF: u8 = 0x1A;
    pub const TYPE_SPEC: u8 = 0x1B;
    pub const IMPL_MAP: u8 = 0x1C;
    pub const FIELD_RVA: u8 = 0x1D;
    pub const ENC_LOG: u8 = 0x1E;
    pub const ENC_MAP: u8 = 0x1F;
    pub const ASSEMBLY: u8 = 0x20;
    pub const ASSEMBLY_PROCESSOR: u8 = 0x21;
    pub const ASSEMBLY_OS: u8 = 0x22;
    pub const ASSEMBLY_REF: u8 = 0x23;
    pub const ASSEMBLY_REF_PROCESSOR: u8 = 0x24;
    pub const ASSEMBLY_REF_OS: u8 = 0x25;
    pub const FILE: u8 = 0x26;
    pub const EXPORTED_TYPE: u8 = 0x27;
    pub const MANIFEST_RESOURCE: u8 = 0x28;
    pub const NESTED_CLASS: u8 = 0x29;
    pub const GENERIC_PARAM: u8 = 0x2A;
    pub const METHOD_SPEC: u8 = 0x2B;
    pub const GENERIC_PARAM_CONSTRAINT: u8 = 0x2C;

    // Portable PDB tables
    pub const DOCUMENT: u8 = 0x30;
    pub const METHOD_DEBUG_INFORMATION: u8 = 0x31;
    pub const LOCAL_SCOPE: u8 = 0x32;
    pub const LOCAL_VARIABLE: u8 = 0x33;
    pub const LOCAL_CONSTANT: u8 = 0x34;
    pub const IMPORT_SCOPE: u8 = 0x35;
    pub const STATE_MACHINE_METHOD: u8 = 0x36;
    pub const CUSTOM_DEBUG_INFORMATION: u8 = 0x37;
}

use ids::*;

/// Coded indices: a row index that can point into one of several tables
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
    HasCustomDebugInformation,
}

impl CodedIndex {
    /// Tables in tag order (`None` for tags that aren't used)
    fn tables(self) -> &'static [Option<u8>] {
        match self {
            CodedIndex::TypeDefOrRef => &[Some(TYPE_DEF), Some(TYPE_REF), Some(TYPE_SPEC)],
            CodedIndex::HasConstant => &[Some(FIELD), Some(PARAM), Some(PROPERTY)],
            CodedIndex::HasCustomAttribute => &[
                Some(METHOD_DEF),
                Some(FIELD),
                Some(TYPE_REF),
                Some(TYPE_DEF),
                Some(PARAM),
                Some(INTERFACE_IMPL),
                Some(MEMBER_REF),
                Some(MODULE),
                Some(DECL_SECURITY),
                Some(PROPERTY),
                Some(EVENT),
                Some(STAND_ALONE_SIG),
                Some(MODULE_REF),
                Some(TYPE_SPEC),
                Some(ASSEMBLY),
                Some(ASSEMBLY_REF),
                Some(FILE),
                Some(EXPORTED_TYPE),
                Some(MANIFEST_RESOURCE),
                Some(GENERIC_PARAM),
                Some(GENERIC_PARAM_CONSTRAINT),
                Some(METHOD_SPEC),
            ],
            CodedIndex::HasFieldMarshal => &[Some(FIELD), Some(PARAM)],
            CodedIndex::HasDeclSecurity => &[Some(TYPE_DEF), Some(METHOD_DEF), Some(ASSEMBLY)],
            CodedIndex::MemberRefParent => &[
                Some(TYPE_DEF),
                Some(TYPE_REF),
                Some(MODULE_REF),
                Some(METHOD_DEF),
                Some(TYPE_SPEC),
            ],
            CodedIndex::HasSemantics => &[Some(EVENT), Some(PROPERTY)],
            CodedIndex::MethodDefOrRef => &[Some(METHOD_DEF), Some(MEMBER_REF)],
            CodedIndex::MemberForwarded => &[Some(FIELD), Some(METHOD_DEF)],
            CodedIndex::Implementation => &[Some(FILE), Some(ASSEMBLY_REF), Some(EXPORTED_TYPE)],
            CodedIndex::CustomAttributeType => {
                &[None, None, Some(METHOD_DEF), Some(MEMBER_REF), None]
            }
            CodedIndex::ResolutionScope => {
                &[Some(MODULE), Some(MODULE_REF), Some(ASSEMBLY_REF), Some(TYPE_REF)]
            }
            CodedIndex::TypeOrMethodDef => &[Some(TYPE_DEF), Some(METHOD_DEF)],
            CodedIndex::HasCustomDebugInformation => &[
                Some(METHOD_DEF),
                Some(FIELD),
                Some(TYPE_REF),
                Some(TYPE_DEF),
                Some(PARAM),
                Some(INTERFACE_IMPL),
                Some(MEMBER_REF),
                Some(MODULE),
                Some(DECL_SECURITY),
                Some(PROPERTY),
                Some(EVENT),
                Some(STAND_ALONE_SIG),
                Some(MODULE_REF),
                Some(TYPE_SPEC),
                Some(ASSEMBLY),
                Some(ASSEMBLY_REF),
                Some(FILE),
                Some(EXPORTED_TYPE),
                Some(MANIFEST_RESOURCE),
                Some(GENERIC_PARAM),
                Some(GENERIC_PARAM_CONSTRAINT),
                Some(METHOD_SPEC),
                Some(DOCUMENT),
                Some(LOCAL_SCOPE),
                Some(LOCAL_VARIABLE),
                Some(LOCAL_CONSTANT),
                Some(IMPORT_SCOPE),
            ],
        }
    }

    /// Number of low bits used for the tag
    fn tag_bits(self) -> u32 {
        let tags = self.tables().len() as u32;
        32 - (tags - 1).leading_zeros()
    }

    /// Token the coded value refers to (`Token::NULL` for a null row)
    pub fn decode(self, value: u32) -> Result<Token, Error> {
        let bits = self.tag_bits();
        let tag = value & ((1 << bits) - 1);
        let row = value >> bits;
        match self.tables().get(tag as usize).copied().flatten() {
            Some(table) => Ok(Token::from_parts(table, row)),
            None => Err(Error::MalformedImage(format!(
                "tag {} is not valid for a {:?} index",
                tag, self
            ))),
        }
    }

    pub fn encode(self, token: Token) -> Result<u32, Error> {
        if token.is_null() {
            return Ok(0);
        }
        let tag = self
            .tables()
            .iter()
            .position(|table| *table == Some(token.table_id()))
            .ok_or(Error::InvalidToken(token))?;
        Ok((token.row() << self.tag_bits()) | tag as u32)
    }
}

/// Kinds of table columns
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Column {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Index(u8),
    Coded(CodedIndex),
}

use Column::*;

/// Column layout of every table this crate knows about
fn schema(table: u8) -> Option<&'static [Column]> {
    let columns: &'static [Column] = match table {
        MODULE => &[U16, Str, Guid, Guid, Guid],
        TYPE_REF => &[Coded(CodedIndex::ResolutionScope), Str, Str],
        TYPE_DEF => &[
            U32,
            Str,
            Str,
            Coded(CodedIndex::TypeDefOrRef),
            Index(FIELD),
            Index(METHOD_DEF),
        ],
        FIELD_PTR => &[Index(FIELD)],
        FIELD => &[U16, Str, Blob],
        METHOD_PTR => &[Index(METHOD_DEF)],
        METHOD_DEF => &[U32, U16, U16, Str, Blob, Index(PARAM)],
        PARAM_PTR => &[Index(PARAM)],
        PARAM => &[U16, U16, Str],
        INTERFACE_IMPL => &[Index(TYPE_DEF), Coded(CodedIndex::TypeDefOrRef)],
        MEMBER_REF => &[Coded(CodedIndex::MemberRefParent), Str, Blob],
        CONSTANT => &[U16, Coded(CodedIndex::HasConstant), Blob],
        CUSTOM_ATTRIBUTE => &[
            Coded(CodedIndex::HasCustomAttribute),
            Coded(CodedIndex::CustomAttributeType),
            Blob,
        ],
        FIELD_MARSHAL => &[Coded(CodedIndex::HasFieldMarshal), Blob],
        DECL_SECURITY => &[U16, Coded(CodedIndex::HasDeclSecurity), Blob],
        CLASS_LAYOUT => &[U16, U32, Index(TYPE_DEF)],
        FIELD_LAYOUT => &[U32, Index(FIELD)],
        STAND_ALONE_SIG => &[Blob],
        EVENT_MAP => &[Index(TYPE_DEF), Index(EVENT)],
        EVENT_PTR => &[Index(EVENT)],
        EVENT => &[U16, Str, Coded(CodedIndex::TypeDefOrRef)],
        PROPERTY_MAP => &[Index(TYPE_DEF), Index(PROPERTY)],
        PROPERTY_PTR => &[Index(PROPERTY)],
        PROPERTY => &[U16, Str, Blob],
        METHOD_SEMANTICS => &[U16, Index(METHOD_DEF), Coded(CodedIndex::HasSemantics)],
        METHOD_IMPL => &[
            Index(TYPE_DEF),
            Coded(CodedIndex::MethodDefOrRef),
            Coded(CodedIndex::MethodDefOrRef),
        ],
        MODULE_REF => &[Str],
        TYPE_SPEC => &[Blob],
        IMPL_MAP => &[U16, Coded(CodedIndex::MemberForwarded), Str, Index(MODULE_REF)],
        FIELD_RVA => &[U32, Index(FIELD)],
        ENC_LOG => &[U32, U32],
        ENC_MAP => &[U32],
        ASSEMBLY => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        ASSEMBLY_PROCESSOR => &[U32],
        ASSEMBLY_OS => &[U32, U32, U32],
        ASSEMBLY_REF => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        ASSEMBLY_REF_PROCESSOR => &[U32, Index(ASSEMBLY_REF)],
        ASSEMBLY_REF_OS => &[U32, U32, U32, Index(ASSEMBLY_REF)],
        FILE => &[U32, Str, Blob],
        EXPORTED_TYPE => &[U32, U32, Str, Str, Coded(CodedIndex::Implementation)],
        MANIFEST_RESOURCE => &[U32, U32, Str, Coded(CodedIndex::Implementation)],
        NESTED_CLASS => &[Index(TYPE_DEF), Index(TYPE_DEF)],
        GENERIC_PARAM => &[U16, U16, Coded(CodedIndex::TypeOrMethodDef), Str],
        METHOD_SPEC => &[Coded(CodedIndex::MethodDefOrRef), Blob],
        GENERIC_PARAM_CONSTRAINT => &[Index(GENERIC_PARAM), Coded(CodedIndex::TypeDefOrRef)],
        DOCUMENT => &[Blob, Guid, Blob, Guid],
        METHOD_DEBUG_INFORMATION => &[Index(DOCUMENT), Blob],
        LOCAL_SCOPE => &[
            Index(METHOD_DEF),
            Index(IMPORT_SCOPE),
            Index(LOCAL_VARIABLE),
            Index(LOCAL_CONSTANT),
            U32,
            U32,
        ],
        LOCAL_VARIABLE => &[U16, U16, Str],
        LOCAL_CONSTANT => &[Str, Blob],
        IMPORT_SCOPE => &[Index(IMPORT_SCOPE), Blob],
        STATE_MACHINE_METHOD => &[Index(METHOD_DEF), Index(METHOD_DEF)],
        CUSTOM_DEBUG_INFORMATION => &[
            Coded(CodedIndex::HasCustomDebugInformation),
            Guid,
            Blob,
        ],
        _ => return None,
    };
    Some(columns)
}

/// Row counts of every table, indexed by table number
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RowCounts(pub [u32; 64]);

impl RowCounts {
    pub fn empty() -> RowCounts {
        RowCounts([0; 64])
    }

    pub fn get(&self, table: u8) -> u32 {
        self.0[table as usize]
    }

    /// Bit vector of the tables that have rows
    pub fn present(&self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .fold(0, |mask, (table, _)| mask | (1 << table))
    }
}

impl Default for RowCounts {
    fn default() -> Self {
        RowCounts::empty()
    }
}

impl fmt::Debug for RowCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .enumerate()
                    .filter(|(_, count)| **count > 0)
                    .map(|(table, count)| (format!("0x{:02X}", table), count)),
            )
            .finish()
    }
}

/// Sizes of the heaps the string, GUID, and blob columns point into
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapSizes {
    pub strings: usize,
    pub guids: usize,
    pub blobs: usize,
}

impl HeapSizes {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.strings > 0xFFFF {
            flags |= TableStream::WIDE_STRINGS;
        }
        if self.guids / 16 > 0xFFFF {
            flags |= TableStream::WIDE_GUIDS;
        }
        if self.blobs > 0xFFFF {
            flags |= TableStream::WIDE_BLOBS;
        }
        flags
    }
}

/// Decoded `#~` stream
#[derive(Clone, PartialEq, Eq)]
pub struct TableStream {
    pub major: u8,
    pub minor: u8,

    /// Bit vector of the tables that are sorted by their primary key
    pub sorted: u64,

    /// Rows of every table, indexed by table number
    rows: Vec<Vec<Vec<u32>>>,

    /// Row counts of tables that live in another metadata image (the assembly, when this is a
    /// portable PDB)
    pub external: RowCounts,
}

impl TableStream {
    const WIDE_STRINGS: u8 = 0x01;
    const WIDE_GUIDS: u8 = 0x02;
    const WIDE_BLOBS: u8 = 0x04;
    const EXTRA_DATA: u8 = 0x40;

    /// Sorted tables of a freshly written assembly
    pub const ASSEMBLY_SORTED: u64 = 0x0000_1600_3301_FA00;

    /// Sorted tables of a freshly written portable PDB
    pub const PDB_SORTED: u64 = (1 << LOCAL_SCOPE) | (1 << STATE_MACHINE_METHOD)
        | (1 << CUSTOM_DEBUG_INFORMATION);

    pub fn new(sorted: u64, external: RowCounts) -> TableStream {
        TableStream {
            major: 2,
            minor: 0,
            sorted,
            rows: vec![vec![]; 64],
            external,
        }
    }

    pub fn parse(bytes: &[u8], external: RowCounts) -> Result<TableStream, Error> {
        let mut reader = Cursor::new(bytes);
        let _reserved = u32::deserialize(&mut reader)?;
        let major = u8::deserialize(&mut reader)?;
        let minor = u8::deserialize(&mut reader)?;
        let heap_flags = u8::deserialize(&mut reader)?;
        let _reserved = u8::deserialize(&mut reader)?;
        let valid = u64::deserialize(&mut reader)?;
        let sorted = u64::deserialize(&mut reader)?;

        let mut counts = RowCounts::empty();
        for table in 0..64u8 {
            if valid & (1 << table) != 0 {
                counts.0[table as usize] = u32::deserialize(&mut reader)?;
            }
        }
        if heap_flags & Self::EXTRA_DATA != 0 {
            let _extra = u32::deserialize(&mut reader)?;
        }

        let widths = Widths::new(heap_flags, &counts, &external);
        let mut rows = vec![vec![]; 64];
        for table in 0..64u8 {
            let count = counts.get(table);
            if count == 0 {
                continue;
            }
            let columns = schema(table).ok_or_else(|| {
                Error::UnsupportedImage(format!("unknown metadata table 0x{:02X}", table))
            })?;
            let table_rows: &mut Vec<Vec<u32>> = &mut rows[table as usize];
            table_rows.reserve(count as usize);
            for _ in 0..count {
                let mut row = Vec::with_capacity(columns.len());
                for column in columns {
                    let value = match widths.of(*column) {
                        2 => u16::deserialize(&mut reader)? as u32,
                        _ => u32::deserialize(&mut reader)?,
                    };
                    row.push(value);
                }
                table_rows.push(row);
            }
        }

        Ok(TableStream {
            major,
            minor,
            sorted,
            rows,
            external,
        })
    }

    pub fn to_bytes(&self, heaps: HeapSizes) -> Result<Vec<u8>, Error> {
        let counts = self.row_counts();
        let heap_flags = heaps.flags();
        let widths = Widths::new(heap_flags, &counts, &self.external);

        let mut bytes = vec![];
        0u32.serialize(&mut bytes)?;
        self.major.serialize(&mut bytes)?;
        self.minor.serialize(&mut bytes)?;
        heap_flags.serialize(&mut bytes)?;
        1u8.serialize(&mut bytes)?;
        counts.present().serialize(&mut bytes)?;
        self.sorted.serialize(&mut bytes)?;
        for count in counts.0.iter().filter(|count| **count > 0) {
            count.serialize(&mut bytes)?;
        }

        for (table, rows) in self.rows.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let columns = schema(table as u8).ok_or_else(|| {
                Error::UnsupportedImage(format!("unknown metadata table 0x{:02X}", table))
            })?;
            for row in rows {
                for (column, value) in columns.iter().zip(row) {
                    match widths.of(*column) {
                        2 => {
                            let value = u16::try_from(*value).map_err(|_| {
                                Error::MalformedImage(format!(
                                    "value 0x{:X} does not fit its column in table 0x{:02X}",
                                    value, table
                                ))
                            })?;
                            bytes.write_u16::<LittleEndian>(value)?
                        }
                        _ => bytes.write_u32::<LittleEndian>(*value)?,
                    }
                }
            }
        }
        crate::binary_format::pad_to(&mut bytes, 4);
        Ok(bytes)
    }

    pub fn row_counts(&self) -> RowCounts {
        let mut counts = RowCounts::empty();
        for (table, rows) in self.rows.iter().enumerate() {
            counts.0[table] = rows.len() as u32;
        }
        counts
    }

    pub fn len(&self, table: u8) -> u32 {
        self.rows[table as usize].len() as u32
    }

    pub fn rows(&self, table: u8) -> &[Vec<u32>] {
        &self.rows[table as usize]
    }

    /// Row by its 1-based index
    pub fn row(&self, table: u8, row: u32) -> Result<&[u32], Error> {
        row.checked_sub(1)
            .and_then(|idx| self.rows[table as usize].get(idx as usize))
            .map(Vec::as_slice)
            .ok_or(Error::InvalidToken(Token::from_parts(table, row)))
    }

    pub fn row_mut(&mut self, table: u8, row: u32) -> Result<&mut Vec<u32>, Error> {
        row.checked_sub(1)
            .and_then(|idx| self.rows[table as usize].get_mut(idx as usize))
            .ok_or(Error::InvalidToken(Token::from_parts(table, row)))
    }

    /// Append a row, returning its 1-based index
    pub fn push(&mut self, table: u8, row: Vec<u32>) -> u32 {
        debug_assert_eq!(Some(row.len()), schema(table).map(<[Column]>::len));
        let rows = &mut self.rows[table as usize];
        rows.push(row);
        rows.len() as u32
    }

    /// Insert a row so that the table stays sorted by its first column
    ///
    /// Rows with the same key keep their order and the new row goes after them.
    pub fn insert_sorted(&mut self, table: u8, row: Vec<u32>) -> u32 {
        let rows = &mut self.rows[table as usize];
        let at = rows.partition_point(|existing| existing[0] <= row[0]);
        rows.insert(at, row);
        at as u32 + 1
    }
}

impl fmt::Debug for TableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableStream({:?})", self.row_counts())
    }
}

/// Byte widths of the variable-sized columns
struct Widths {
    heap_flags: u8,
    counts: [u32; 64],
}

impl Widths {
    fn new(heap_flags: u8, local: &RowCounts, external: &RowCounts) -> Widths {
        let mut counts = [0; 64];
        for (table, count) in counts.iter_mut().enumerate() {
            *count = local.0[table].max(external.0[table]);
        }
        Widths { heap_flags, counts }
    }

    fn of(&self, column: Column) -> usize {
        let wide_heap = |flag: u8| if self.heap_flags & flag != 0 { 4 } else { 2 };
        match column {
            U16 => 2,
            U32 => 4,
            Str => wide_heap(TableStream::WIDE_STRINGS),
            Guid => wide_heap(TableStream::WIDE_GUIDS),
            Blob => wide_heap(TableStream::WIDE_BLOBS),
            Index(table) => {
                if self.counts[table as usize] > 0xFFFF {
                    4
                } else {
                    2
                }
            }
            Coded(coded) => {
                let largest = coded
                    .tables()
                    .iter()
                    .flatten()
                    .map(|table| self.counts[*table as usize])
                    .max()
                    .unwrap_or(0);
                if largest < (1 << (16 - coded.tag_bits())) {
                    2
                } else {
                    4
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SMALL_HEAPS: HeapSizes = HeapSizes {
        strings: 0x100,
        guids: 16,
        blobs: 0x100,
    };

    #[test]
    fn coded_indices() {
        assert_eq!(CodedIndex::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndex::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndex::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndex::MethodDefOrRef.tag_bits(), 1);

        // the assembly row as the parent of a custom attribute
        let assembly = Token::from_parts(ASSEMBLY, 1);
        assert_eq!(CodedIndex::HasCustomAttribute.encode(assembly).unwrap(), 0x2E);
        assert_eq!(CodedIndex::HasCustomAttribute.decode(0x2E).unwrap(), assembly);

        let ctor = Token(0x0A00_0005);
        assert_eq!(CodedIndex::CustomAttributeType.encode(ctor).unwrap(), (5 << 3) | 3);
        assert!(CodedIndex::CustomAttributeType.decode(1).is_err());
        assert!(CodedIndex::TypeDefOrRef.encode(ctor).is_err());
        assert_eq!(CodedIndex::TypeDefOrRef.encode(Token::NULL).unwrap(), 0);
    }

    #[test]
    fn tables_read_back() {
        let mut tables = TableStream::new(TableStream::ASSEMBLY_SORTED, RowCounts::empty());
        tables.push(MODULE, vec![0, 1, 1, 0, 0]);
        let object = tables.push(TYPE_REF, vec![(1 << 2) | 2, 10, 20]);
        tables.push(TYPE_DEF, vec![0, 30, 0, 0, 1, 1]);
        tables.push(TYPE_DEF, vec![0x0010_0001, 40, 50, (object << 2) | 1, 1, 1]);

        let bytes = tables.to_bytes(SMALL_HEAPS).unwrap();
        // header, three row counts, then 2-byte columns throughout
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(&bytes[8..16], &0b111u64.to_le_bytes());

        let parsed = TableStream::parse(&bytes, RowCounts::empty()).unwrap();
        assert_eq!(parsed, tables);
        assert_eq!(parsed.row(TYPE_DEF, 2).unwrap()[3], 0x05);
        assert!(parsed.row(TYPE_DEF, 3).is_err());
        assert!(parsed.row(TYPE_DEF, 0).is_err());
    }

    #[test]
    fn wide_indices_follow_row_counts() {
        let mut tables = TableStream::new(0, RowCounts::empty());
        for _ in 0..0x1_0000 {
            tables.push(STAND_ALONE_SIG, vec![0]);
        }
        tables.push(LOCAL_SCOPE, vec![1, 0, 0, 0, 0, 4]);
        // 14 bits of a HasCustomAttribute index are too few for 2^16 signatures
        let counts = tables.row_counts();
        let widths = Widths::new(0, &counts, &RowCounts::empty());
        assert_eq!(widths.of(Coded(CodedIndex::HasCustomAttribute)), 4);
        assert_eq!(widths.of(Index(METHOD_DEF)), 2);

        let mut external = RowCounts::empty();
        external.0[METHOD_DEF as usize] = 0x1_0000;
        let widths = Widths::new(TableStream::WIDE_BLOBS, &counts, &external);
        assert_eq!(widths.of(Index(METHOD_DEF)), 4);
        assert_eq!(widths.of(Blob), 4);
        assert_eq!(widths.of(Str), 2);
    }

    #[test]
    fn sorted_insertion_goes_after_equal_keys() {
        let mut tables = TableStream::new(0, RowCounts::empty());
        tables.push(CUSTOM_ATTRIBUTE, vec![0x20, 0x0B, 1]);
        tables.push(CUSTOM_ATTRIBUTE, vec![0x2E, 0x13, 2]);
        tables.push(CUSTOM_ATTRIBUTE, vec![0x43, 0x13, 3]);
        assert_eq!(tables.insert_sorted(CUSTOM_ATTRIBUTE, vec![0x2E, 0x1B, 4]), 3);
        let blobs: Vec<u32> = tables.rows(CUSTOM_ATTRIBUTE).iter().map(|row| row[2]).collect();
        assert_eq!(blobs, vec![1, 2, 4, 3]);
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let mut bytes = vec![0, 0, 0, 0, 2, 0, 0, 1];
        bytes.extend_from_slice(&(1u64 << 0x3F).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            TableStream::parse(&bytes, RowCounts::empty()),
            Err(Error::UnsupportedImage(_))
        ));
    }
}
