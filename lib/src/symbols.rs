//! Portable PDB debug symbols
//!
//! Symbols for `Game.dll` live next to it in `Game.pdb`. A portable PDB is a metadata image of
//! its own: a metadata root with `#~` tables and heaps, plus a `#Pdb` stream holding the PDB id
//! and the row counts of the assembly tables it indexes into.
//!
//! The `MethodDebugInformation` table runs parallel to the assembly's `MethodDef` table and holds
//! the sequence points of each method. `LocalScope` rows hold IL ranges. Both are updated when
//! method bodies change; every other table and heap is written back as it was read.
//!
//! Windows PDBs share the `.pdb` extension, and Mono keeps its symbols in `Game.dll.mdb`. Both
//! are recognized so that they can be reported, but neither can be rewritten.
//!
//! [0]: https://github.com/dotnet/runtime/blob/main/docs/design/specs/PortablePdb-Metadata.md

use crate::binary_format::{
    padded, read_compressed_i32, read_compressed_u32, write_compressed_i32, write_compressed_u32,
    Deserialize, Serialize,
};
use crate::metadata::root::MetadataRoot;
use crate::metadata::tables::{ids, HeapSizes};
use crate::metadata::{Assembly, BlobHeap, GuidHeap, RowCounts, StringHeap, TableStream, Token};
use crate::Error;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

/// Source range of the instructions starting at an IL offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    pub il_offset: u32,

    /// 1-based `Document` row
    pub document: u32,

    pub start_line: u32,
    pub start_column: u16,
    pub end_line: u32,
    pub end_column: u16,
}

impl SequencePoint {
    /// Line of hidden sequence points (code that debuggers should step over)
    pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

    /// Point covering one character at `line:column`
    pub fn new(il_offset: u32, document: u32, line: u32, column: u16) -> SequencePoint {
        SequencePoint {
            il_offset,
            document,
            start_line: line,
            start_column: column,
            end_line: line,
            end_column: column.saturating_add(1),
        }
    }

    pub fn hidden(il_offset: u32, document: u32) -> SequencePoint {
        SequencePoint {
            il_offset,
            document,
            start_line: SequencePoint::HIDDEN_LINE,
            start_column: 0,
            end_line: SequencePoint::HIDDEN_LINE,
            end_column: 0,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.start_line == SequencePoint::HIDDEN_LINE
    }
}

/// IL range of a `LocalScope` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScope {
    /// 1-based `LocalScope` row this range came from
    pub row: u32,
    pub start_offset: u32,
    pub length: u32,
}

/// Formats a symbol file next to an assembly can be in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SymbolFormat {
    Portable,
    Windows,
    Mdb,
}

impl SymbolFormat {
    const WINDOWS_MAGIC: &'static [u8] = b"Microsoft C/C++ MSF 7.00\r\n\x1ADS\0\0\0";
    const MDB_MAGIC: u64 = 0x45E8_2623_FD7F_A614;

    pub fn detect(bytes: &[u8]) -> Option<SymbolFormat> {
        if bytes.starts_with(MetadataRoot::MAGIC) {
            Some(SymbolFormat::Portable)
        } else if bytes.starts_with(SymbolFormat::WINDOWS_MAGIC) {
            Some(SymbolFormat::Windows)
        } else if bytes.starts_with(&SymbolFormat::MDB_MAGIC.to_le_bytes()) {
            Some(SymbolFormat::Mdb)
        } else {
            None
        }
    }
}

impl fmt::Display for SymbolFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SymbolFormat::Portable => "portable PDB",
            SymbolFormat::Windows => "Windows PDB",
            SymbolFormat::Mdb => "Mono MDB",
        })
    }
}

/// `Game.pdb` for `Game.dll`
pub fn pdb_path_for(assembly_path: &Path) -> PathBuf {
    assembly_path.with_extension("pdb")
}

/// `Game.dll.mdb` for `Game.dll`
pub fn mdb_path_for(assembly_path: &Path) -> PathBuf {
    let mut path = assembly_path.as_os_str().to_owned();
    path.push(".mdb");
    PathBuf::from(path)
}

/// Find the symbol file of an assembly, if there is one (`.pdb` wins over `.mdb`)
pub fn locate(assembly_path: &Path) -> Option<PathBuf> {
    [pdb_path_for(assembly_path), mdb_path_for(assembly_path)]
        .into_iter()
        .find(|path| path.is_file())
}

/// Language GUID of C# documents
const CSHARP: [u8; 16] = [
    0xF8, 0x62, 0x51, 0x3F, 0xC6, 0x07, 0xD3, 0x11, 0x90, 0x53, 0x00, 0xC0, 0x4F, 0xA3, 0x02, 0xA1,
];

const PDB_VERSION: &str = "PDB v1.0";

/// Debug information of one `MethodDef` row
#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodDebugInformation {
    /// `StandAloneSig` row of the locals signature
    local_signature: u32,
    points: Vec<SequencePoint>,
}

/// A loaded portable PDB
#[derive(Clone, PartialEq)]
pub struct SymbolFile {
    /// PDB id, matched against the CodeView entry in the assembly's debug directory
    pub id: [u8; 20],
    pub entry_point: Token,

    /// Document names, in `Document` table order
    pub documents: Vec<String>,

    methods: Vec<MethodDebugInformation>,
    root: MetadataRoot,
    tables: TableStream,
    strings: StringHeap,
    blobs: BlobHeap,
    guids: GuidHeap,
}

impl fmt::Debug for SymbolFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolFile")
            .field("documents", &self.documents)
            .field("tables", &self.tables)
            .finish()
    }
}

impl SymbolFile {
    /// Empty symbols with the given documents (rows `1..=documents.len()`)
    ///
    /// Sequence points of every method are filled in by [`SymbolFile::rewrite`].
    pub fn new(documents: &[&str]) -> Result<SymbolFile, Error> {
        let mut symbols = SymbolFile {
            id: [0; 20],
            entry_point: Token::NULL,
            documents: vec![],
            methods: vec![],
            root: MetadataRoot::new(PDB_VERSION),
            tables: TableStream::new(TableStream::PDB_SORTED, RowCounts::empty()),
            strings: StringHeap::new(),
            blobs: BlobHeap::new(),
            guids: GuidHeap::new(),
        };
        for stream in ["#Pdb", "#~", "#Strings", "#US", "#GUID", "#Blob"] {
            symbols.root.set_stream(stream, vec![]);
        }
        symbols.root.set_stream("#US", vec![0; 4]);

        let language = symbols.guids.add(CSHARP);
        for name in documents {
            let name_blob = encode_document_name(&mut symbols.blobs, name)?;
            symbols.tables.push(ids::DOCUMENT, vec![name_blob, 0, 0, language]);
            symbols.documents.push((*name).to_owned());
        }
        Ok(symbols)
    }

    /// Add a `LocalScope` row covering `length` bytes of IL of a method
    pub fn add_local_scope(&mut self, method: Token, start_offset: u32, length: u32) -> u32 {
        self.tables.insert_sorted(
            ids::LOCAL_SCOPE,
            vec![method.row(), 0, 0, 0, start_offset, length],
        )
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, Error> {
        match SymbolFormat::detect(bytes) {
            Some(SymbolFormat::Portable) => {}
            Some(format) => return Err(Error::UnsupportedSymbols(format.to_string())),
            None => {
                return Err(Error::BadMagic {
                    expected: MetadataRoot::MAGIC,
                    found: bytes.iter().take(4).copied().collect(),
                })
            }
        }

        let root = MetadataRoot::parse(bytes)?;
        let pdb = root
            .stream("#Pdb")
            .ok_or_else(|| Error::InvalidSymbols(String::from("no #Pdb stream")))?;
        let mut reader = Cursor::new(pdb);
        let mut id = [0; 20];
        reader.read_exact(&mut id)?;
        let entry_point = Token(u32::deserialize(&mut reader)?);
        let referenced = u64::deserialize(&mut reader)?;
        let mut external = RowCounts::empty();
        for (table, count) in external.0.iter_mut().enumerate() {
            if referenced & (1 << table) != 0 {
                *count = u32::deserialize(&mut reader)?;
            }
        }

        let tables = root
            .stream("#~")
            .ok_or_else(|| Error::InvalidSymbols(String::from("no #~ stream")))?;
        let tables = TableStream::parse(tables, external)?;
        let heap = |name: &str| root.stream(name).map(<[u8]>::to_vec).unwrap_or_default();
        let strings = StringHeap::from_bytes(heap("#Strings"));
        let blobs = BlobHeap::from_bytes(heap("#Blob"));
        let guids = GuidHeap::from_bytes(heap("#GUID"));

        let documents = tables
            .rows(ids::DOCUMENT)
            .iter()
            .map(|row| decode_document_name(&blobs, row[0]))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut methods = Vec::with_capacity(tables.len(ids::METHOD_DEBUG_INFORMATION) as usize);
        for (idx, row) in tables.rows(ids::METHOD_DEBUG_INFORMATION).iter().enumerate() {
            let info = decode_sequence_points(blobs.get(row[1])?, row[0])?;
            if let Some(point) = info
                .points
                .iter()
                .find(|point| point.document == 0 || point.document as usize > documents.len())
            {
                return Err(Error::InvalidSymbols(format!(
                    "method row {} refers to missing document {}",
                    idx + 1,
                    point.document
                )));
            }
            methods.push(info);
        }

        Ok(SymbolFile {
            id,
            entry_point,
            documents,
            methods,
            root,
            tables,
            strings,
            blobs,
            guids,
        })
    }

    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<SymbolFile, Error> {
        SymbolFile::from_bytes(&fs::read(path)?)
    }

    /// Hand sequence points and local scopes out to the methods of the assembly's main module
    ///
    /// Returns the number of methods that received sequence points.
    pub fn attach(&self, assembly: &mut Assembly) -> Result<usize, Error> {
        let module = assembly
            .main_module_mut()
            .ok_or_else(|| Error::InvalidSymbols(String::from("assembly has no modules")))?;
        let method_count = module.methods().count();
        if self.methods.len() > method_count {
            return Err(Error::InvalidSymbols(format!(
                "symbols describe {} methods but the assembly only has {}",
                self.methods.len(),
                method_count
            )));
        }

        let mut attached = 0;
        for (method, info) in module.methods_mut().zip(&self.methods) {
            method.sequence_points = info.points.clone();
            if !info.points.is_empty() {
                attached += 1;
            }
        }
        for (idx, row) in self.tables.rows(ids::LOCAL_SCOPE).iter().enumerate() {
            let token = Token::from_parts(ids::METHOD_DEF, row[0]);
            let method = module.method_mut(token).map_err(|_| {
                Error::InvalidSymbols(format!("local scope of missing method {:?}", token))
            })?;
            method.local_scopes.push(LocalScope {
                row: idx as u32 + 1,
                start_offset: row[4],
                length: row[5],
            });
        }
        Ok(attached)
    }

    /// Serialize the symbols for the assembly as it is now
    ///
    /// `row_counts` are the row counts of the tables the assembly was written with. Sequence
    /// points and local scope ranges come from the assembly's methods. Methods appended since
    /// the symbols were read get rows of their own.
    pub fn rewrite(&self, assembly: &Assembly, row_counts: RowCounts) -> Result<Vec<u8>, Error> {
        let module = assembly
            .main_module()
            .ok_or_else(|| Error::InvalidSymbols(String::from("assembly has no modules")))?;
        let mut tables = self.tables.clone();
        let mut blobs = self.blobs.clone();
        tables.external = row_counts;

        for (idx, method) in module.methods().enumerate() {
            let row = idx as u32 + 1;
            let existing = self.methods.get(idx);
            let local_signature = match (&method.body, existing) {
                (Some(body), _) => body.local_var_sig.row(),
                (None, Some(info)) => info.local_signature,
                (None, None) => 0,
            };
            match existing {
                Some(info)
                    if info.points == method.sequence_points
                        && info.local_signature == local_signature => {}
                Some(_) => {
                    let (document, blob) =
                        encode_sequence_points(local_signature, &method.sequence_points)?;
                    let blob = blobs.add(&blob)?;
                    *tables.row_mut(ids::METHOD_DEBUG_INFORMATION, row)? = vec![document, blob];
                }
                None => {
                    let (document, blob) =
                        encode_sequence_points(local_signature, &method.sequence_points)?;
                    let blob = blobs.add(&blob)?;
                    tables.push(ids::METHOD_DEBUG_INFORMATION, vec![document, blob]);
                }
            }

            for scope in &method.local_scopes {
                let columns = tables.row_mut(ids::LOCAL_SCOPE, scope.row)?;
                columns[4] = scope.start_offset;
                columns[5] = scope.length;
            }
        }

        let mut pdb = self.id.to_vec();
        self.entry_point.0.serialize(&mut pdb)?;
        let referenced = row_counts.present() & ((1 << ids::DOCUMENT) - 1);
        referenced.serialize(&mut pdb)?;
        for table in 0..ids::DOCUMENT {
            if referenced & (1 << table) != 0 {
                row_counts.get(table).serialize(&mut pdb)?;
            }
        }

        let heaps = HeapSizes {
            strings: self.strings.len(),
            guids: self.guids.len(),
            blobs: blobs.len(),
        };
        let mut root = self.root.clone();
        root.set_stream("#Pdb", pdb);
        root.set_stream("#~", tables.to_bytes(heaps)?);
        root.set_stream("#Strings", padded(self.strings.as_bytes(), 4));
        root.set_stream("#GUID", self.guids.as_bytes().to_vec());
        root.set_stream("#Blob", padded(blobs.as_bytes(), 4));
        root.to_bytes()
    }
}

/// Document names are stored split on their separator, with each part in a blob of its own
fn encode_document_name(blobs: &mut BlobHeap, name: &str) -> Result<u32, Error> {
    let separator = ['/', '\\'].into_iter().find(|sep| name.contains(*sep));
    let mut blob = vec![];
    match separator {
        Some(separator) => {
            blob.push(separator as u8);
            for part in name.split(separator) {
                let part = blobs.add(part.as_bytes())?;
                write_compressed_u32(&mut blob, part)?;
            }
        }
        None => {
            blob.push(0);
            let part = blobs.add(name.as_bytes())?;
            write_compressed_u32(&mut blob, part)?;
        }
    }
    blobs.add(&blob)
}

fn decode_document_name(blobs: &BlobHeap, offset: u32) -> Result<String, Error> {
    let blob = blobs.get(offset)?;
    let (separator, parts) = blob
        .split_first()
        .ok_or_else(|| Error::InvalidSymbols(String::from("empty document name")))?;
    let mut reader = Cursor::new(parts);
    let mut names = vec![];
    while (reader.position() as usize) < parts.len() {
        let part = read_compressed_u32(&mut reader)?;
        names.push(String::from_utf8(blobs.get(part)?.to_vec())?);
    }
    let separator = if *separator == 0 {
        String::new()
    } else {
        char::from(*separator).to_string()
    };
    Ok(names.join(separator.as_str()))
}

fn out_of_range(what: &str) -> Error {
    Error::InvalidSymbols(format!("sequence point {} is out of range", what))
}

fn decode_sequence_points(blob: &[u8], document: u32) -> Result<MethodDebugInformation, Error> {
    if blob.is_empty() {
        return Ok(MethodDebugInformation {
            local_signature: 0,
            points: vec![],
        });
    }

    let mut reader = Cursor::new(blob);
    let local_signature = read_compressed_u32(&mut reader)?;
    let mut document = if document == 0 {
        read_compressed_u32(&mut reader)?
    } else {
        document
    };

    let mut points: Vec<SequencePoint> = vec![];
    let mut previous_start: Option<(u32, u16)> = None;
    while (reader.position() as usize) < blob.len() {
        let delta_offset = read_compressed_u32(&mut reader)?;
        let il_offset = match points.last() {
            None => delta_offset,
            Some(_) if delta_offset == 0 => {
                document = read_compressed_u32(&mut reader)?;
                continue;
            }
            Some(previous) => previous
                .il_offset
                .checked_add(delta_offset)
                .ok_or_else(|| out_of_range("offset"))?,
        };

        let delta_lines = read_compressed_u32(&mut reader)?;
        let delta_columns = if delta_lines == 0 {
            read_compressed_u32(&mut reader)? as i64
        } else {
            read_compressed_i32(&mut reader)? as i64
        };
        if delta_lines == 0 && delta_columns == 0 {
            points.push(SequencePoint::hidden(il_offset, document));
            continue;
        }

        let (start_line, start_column) = match previous_start {
            None => (
                read_compressed_u32(&mut reader)? as i64,
                read_compressed_u32(&mut reader)? as i64,
            ),
            Some((line, column)) => (
                line as i64 + read_compressed_i32(&mut reader)? as i64,
                column as i64 + read_compressed_i32(&mut reader)? as i64,
            ),
        };
        let start_line = u32::try_from(start_line).map_err(|_| out_of_range("line"))?;
        let start_column = u16::try_from(start_column).map_err(|_| out_of_range("column"))?;
        let end_line = start_line
            .checked_add(delta_lines)
            .ok_or_else(|| out_of_range("line"))?;
        let end_column = u16::try_from(start_column as i64 + delta_columns)
            .map_err(|_| out_of_range("column"))?;

        previous_start = Some((start_line, start_column));
        points.push(SequencePoint {
            il_offset,
            document,
            start_line,
            start_column,
            end_line,
            end_column,
        });
    }

    Ok(MethodDebugInformation {
        local_signature,
        points,
    })
}

/// Encode sequence points, returning the value of the `Document` column along with the blob
///
/// The column names the document when all points share one. Otherwise it is zero and the
/// initial document goes into the blob header.
fn encode_sequence_points(
    local_signature: u32,
    points: &[SequencePoint],
) -> Result<(u32, Vec<u8>), Error> {
    let first = match points.first() {
        Some(first) => first,
        None => return Ok((0, vec![])),
    };
    let single_document = points.iter().all(|point| point.document == first.document);

    let mut blob = vec![];
    write_compressed_u32(&mut blob, local_signature)?;
    if !single_document {
        write_compressed_u32(&mut blob, first.document)?;
    }

    let mut document = first.document;
    let mut previous_offset: Option<u32> = None;
    let mut previous_start: Option<(u32, u16)> = None;
    for point in points {
        if point.document != document {
            write_compressed_u32(&mut blob, 0)?;
            write_compressed_u32(&mut blob, point.document)?;
            document = point.document;
        }

        let delta_offset = match previous_offset {
            None => point.il_offset,
            Some(previous) if point.il_offset > previous => point.il_offset - previous,
            Some(previous) => {
                return Err(Error::InvalidSymbols(format!(
                    "sequence point at IL_{:04x} follows the one at IL_{:04x}",
                    point.il_offset, previous
                )))
            }
        };
        write_compressed_u32(&mut blob, delta_offset)?;
        previous_offset = Some(point.il_offset);

        if point.is_hidden() {
            write_compressed_u32(&mut blob, 0)?;
            write_compressed_u32(&mut blob, 0)?;
            continue;
        }

        let delta_lines = point
            .end_line
            .checked_sub(point.start_line)
            .ok_or_else(|| out_of_range("line"))?;
        let delta_columns = point.end_column as i32 - point.start_column as i32;
        write_compressed_u32(&mut blob, delta_lines)?;
        if delta_lines == 0 {
            // zero columns on a single line would read back as a hidden point
            if delta_columns <= 0 {
                return Err(out_of_range("column"));
            }
            write_compressed_u32(&mut blob, delta_columns as u32)?;
        } else {
            write_compressed_i32(&mut blob, delta_columns)?;
        }

        match previous_start {
            None => {
                write_compressed_u32(&mut blob, point.start_line)?;
                write_compressed_u32(&mut blob, point.start_column as u32)?;
            }
            Some((line, column)) => {
                write_compressed_i32(&mut blob, point.start_line as i32 - line as i32)?;
                write_compressed_i32(&mut blob, point.start_column as i32 - column as i32)?;
            }
        }
        previous_start = Some((point.start_line, point.start_column));
    }
    Ok((if single_document { first.document } else { 0 }, blob))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::{MethodDef, MethodSig, Module, RawBody, TypeDef};

    fn assembly() -> Assembly {
        let mut module = Module::new("Game.dll");
        let mut player = TypeDef::new("Game", "Player", Token::NULL);
        player
            .methods
            .push(MethodDef::new("Awake", MethodSig::nullary(), Some(RawBody::new(vec![0x2A]))));
        player.methods.push(MethodDef::new(
            "Update",
            MethodSig::nullary(),
            Some(RawBody::new(vec![0x00, 0x00, 0x00, 0x2A])),
        ));
        module.types.push(player);
        let mut assembly = Assembly::new("Game");
        assembly.modules.push(module);
        assembly
    }

    fn row_counts(assembly: &Assembly) -> RowCounts {
        let mut counts = RowCounts::empty();
        counts.0[ids::METHOD_DEF as usize] = assembly.modules[0].methods().count() as u32;
        counts.0[ids::TYPE_DEF as usize] = assembly.modules[0].types.len() as u32;
        counts
    }

    fn update_points() -> Vec<SequencePoint> {
        vec![
            SequencePoint::new(0, 1, 10, 5),
            SequencePoint::hidden(1, 1),
            SequencePoint {
                end_line: 14,
                end_column: 2,
                ..SequencePoint::new(2, 2, 12, 9)
            },
            SequencePoint::new(3, 1, 11, 5),
        ]
    }

    fn written(symbols: &SymbolFile, assembly: &Assembly) -> SymbolFile {
        let bytes = symbols.rewrite(assembly, row_counts(assembly)).unwrap();
        SymbolFile::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn sequence_points_read_back() {
        let mut assembly = assembly();
        assembly.modules[0].types[1].methods[1].sequence_points = update_points();
        let symbols = SymbolFile::new(&["Assets/Player.cs", "C:\\Game\\Shared.cs"]).unwrap();
        let read = written(&symbols, &assembly);
        assert_eq!(read.documents, vec!["Assets/Player.cs", "C:\\Game\\Shared.cs"]);

        let mut fresh = self::assembly();
        assert_eq!(read.attach(&mut fresh).unwrap(), 1);
        assert_eq!(fresh.modules[0].types[1].methods[1].sequence_points, update_points());
        assert!(fresh.modules[0].types[1].methods[0].sequence_points.is_empty());
    }

    #[test]
    fn single_documents_go_in_the_row() {
        let points = vec![SequencePoint::new(0, 2, 3, 1), SequencePoint::new(4, 2, 4, 1)];
        let (document, blob) = encode_sequence_points(0, &points).unwrap();
        assert_eq!(document, 2);
        assert_eq!(decode_sequence_points(&blob, document).unwrap().points, points);

        let (document, blob) = encode_sequence_points(0, &update_points()).unwrap();
        assert_eq!(document, 0);
        assert_eq!(decode_sequence_points(&blob, 0).unwrap().points, update_points());
    }

    #[test]
    fn sequence_points_must_move_forward() {
        let points = vec![SequencePoint::new(4, 1, 3, 1), SequencePoint::new(4, 1, 4, 1)];
        assert!(matches!(
            encode_sequence_points(0, &points),
            Err(Error::InvalidSymbols(_))
        ));
    }

    #[test]
    fn unchanged_methods_keep_their_rows() {
        let mut assembly = assembly();
        assembly.modules[0].types[1].methods[1].sequence_points = update_points();
        let first = written(&SymbolFile::new(&["Player.cs", "Shared.cs"]).unwrap(), &assembly);
        let second = written(&first, &assembly);
        assert_eq!(second.tables, first.tables);
        assert_eq!(second.blobs, first.blobs);

        // moved points get a new blob, the other rows stay
        let update = &mut assembly.modules[0].types[1].methods[1];
        for point in &mut update.sequence_points {
            point.il_offset += 1;
        }
        let third = written(&second, &assembly);
        let rows = |file: &SymbolFile| file.tables.rows(ids::METHOD_DEBUG_INFORMATION).to_vec();
        assert_eq!(rows(&third)[0], rows(&second)[0]);
        assert_ne!(rows(&third)[1], rows(&second)[1]);
        assert_eq!(third.methods[1].points[0].il_offset, 1);
    }

    #[test]
    fn local_scopes_follow_their_methods() {
        let mut assembly = assembly();
        let update = assembly.modules[0].method_token(1, 1);
        let mut symbols = SymbolFile::new(&["Player.cs"]).unwrap();
        symbols.add_local_scope(update, 0, 4);
        let symbols = written(&symbols, &assembly);

        symbols.attach(&mut assembly).unwrap();
        let method = assembly.modules[0].method_mut(update).unwrap();
        assert_eq!(
            method.local_scopes,
            vec![LocalScope {
                row: 1,
                start_offset: 0,
                length: 4
            }]
        );
        method.local_scopes[0].length = 9;

        let symbols = written(&symbols, &assembly);
        assert_eq!(symbols.tables.rows(ids::LOCAL_SCOPE)[0][5], 9);
        assert_eq!(symbols.tables.external.get(ids::METHOD_DEF), 2);
    }

    #[test]
    fn symbols_for_more_methods_are_rejected() {
        let mut bigger = assembly();
        bigger.modules[0].types[1]
            .methods
            .push(MethodDef::new("Start", MethodSig::nullary(), None));
        let symbols = written(&SymbolFile::new(&["Player.cs"]).unwrap(), &bigger);
        assert!(matches!(
            symbols.attach(&mut assembly()),
            Err(Error::InvalidSymbols(_))
        ));
    }

    #[test]
    fn other_formats_are_reported() {
        let mut windows = SymbolFormat::WINDOWS_MAGIC.to_vec();
        windows.extend_from_slice(&[0; 32]);
        let mut mdb = SymbolFormat::MDB_MAGIC.to_le_bytes().to_vec();
        mdb.extend_from_slice(&[0; 8]);
        for bytes in [windows, mdb] {
            assert!(matches!(
                SymbolFile::from_bytes(&bytes),
                Err(Error::UnsupportedSymbols(_))
            ));
        }
        match SymbolFile::from_bytes(b"NOPE\x00\x00\x00\x00") {
            Err(Error::BadMagic { found, .. }) => assert_eq!(&found, b"NOPE"),
            other => panic!("expected a magic error, got {:?}", other),
        }
    }

    #[test]
    fn pdb_is_preferred_over_mdb() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("Game.dll");
        assert_eq!(locate(&dll), None);

        let mdb = dir.path().join("Game.dll.mdb");
        fs::write(&mdb, b"").unwrap();
        assert_eq!(locate(&dll), Some(mdb));

        let pdb = dir.path().join("Game.pdb");
        fs::write(&pdb, b"").unwrap();
        assert_eq!(locate(&dll), Some(pdb));
    }
}
