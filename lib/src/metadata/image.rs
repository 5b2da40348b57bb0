//! Reading and writing assemblies as PE/CLI images
//!
//! Loading decodes the tables into the [`Assembly`] model and keeps the image, its heaps, and
//! a snapshot of the freshly loaded model next to it. Writing compares the model against that
//! snapshot:
//!
//!   - rows that didn't change are written back exactly as they were
//!   - rows that changed are re-encoded in place
//!   - new rows (references, types, methods, attributes) are appended
//!
//! Heaps are append-only, so every offset still in use stays valid. New method bodies and the
//! rebuilt metadata go into an extra section at the end of the image; the old metadata is left
//! where it was, unreferenced.

use crate::binary_format::{pad_to, padded};
use crate::metadata::pe::{dirs, PeImage};
use crate::metadata::root::MetadataRoot;
use crate::metadata::tables::{ids, CodedIndex, HeapSizes, RowCounts, TableStream};
use crate::metadata::{
    Assembly, AssemblyRef, BlobHeap, CustomAttribute, GuidHeap, MemberRef, MemberSig, MethodAttributes,
    MethodDef, MethodImplAttributes, MethodSig, Module, RawBody, ResolutionScope, StringHeap,
    Token, TypeAttributes, TypeDef, TypeRef, UserStringHeap,
};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Everything about a loaded image that the model doesn't hold
#[derive(Clone, PartialEq)]
pub(crate) struct LoadedImage {
    pe: PeImage,
    cli_header: Vec<u8>,
    root: MetadataRoot,
    tables: TableStream,
    strings: StringHeap,
    blobs: BlobHeap,
    guids: GuidHeap,

    /// `CustomAttribute` rows of the assembly-level attributes, in model order
    attribute_rows: Vec<u32>,

    /// The model as it was loaded
    baseline: Assembly,
}

impl fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("pe", &self.pe)
            .field("tables", &self.tables)
            .finish()
    }
}

const CLI_HEADER_SIZE: usize = 72;
const CLI_FLAG_STRONG_NAME_SIGNED: u32 = 0x08;
const RUNTIME_VERSION: &str = "v4.0.30319";
const SECTION_NAME: &str = ".ilspan";

impl Assembly {
    pub fn from_bytes(bytes: &[u8]) -> Result<Assembly, Error> {
        let pe = PeImage::parse(bytes.to_vec())?;
        let cli = pe.directory(dirs::CLI_HEADER);
        if cli.rva == 0 {
            return Err(Error::UnsupportedImage(String::from(
                "not a managed assembly (no CLI header)",
            )));
        }
        let cli_header = pe.read(cli.rva, CLI_HEADER_SIZE as u32)?.to_vec();
        let metadata_rva = LittleEndian::read_u32(&cli_header[8..]);
        let metadata_size = LittleEndian::read_u32(&cli_header[12..]);
        let root = MetadataRoot::parse(pe.read(metadata_rva, metadata_size)?)?;

        if root.stream("#-").is_some() {
            return Err(Error::UnsupportedImage(String::from(
                "uncompressed metadata tables (#-)",
            )));
        }
        let tables = root
            .stream("#~")
            .ok_or_else(|| Error::MalformedImage(String::from("no #~ stream")))?;
        let tables = TableStream::parse(tables, RowCounts::empty())?;
        let heap = |name: &str| root.stream(name).map(<[u8]>::to_vec).unwrap_or_default();
        let strings = StringHeap::from_bytes(heap("#Strings"));
        let blobs = BlobHeap::from_bytes(heap("#Blob"));
        let guids = GuidHeap::from_bytes(heap("#GUID"));
        let user_strings = UserStringHeap::from_bytes(heap("#US"));

        for table in [ids::FIELD_PTR, ids::METHOD_PTR, ids::PARAM_PTR, ids::EVENT_PTR, ids::PROPERTY_PTR] {
            if tables.len(table) > 0 {
                return Err(Error::UnsupportedImage(format!(
                    "indirection table 0x{:02X} is in use",
                    table
                )));
            }
        }

        let reader = ModelReader {
            pe: &pe,
            tables: &tables,
            strings: &strings,
            blobs: &blobs,
        };
        let (mut assembly, attribute_rows) = reader.read_assembly(user_strings)?;

        let baseline = assembly.clone();
        assembly.image = Some(Box::new(LoadedImage {
            pe,
            cli_header,
            root,
            tables,
            strings,
            blobs,
            guids,
            attribute_rows,
            baseline,
        }));
        Ok(assembly)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        self.encode().map(|(bytes, _)| bytes)
    }

    /// Serialize the assembly, also returning the row counts of the tables written
    ///
    /// Portable PDBs index into the assembly's tables and need those counts.
    pub fn encode(&self) -> Result<(Vec<u8>, RowCounts), Error> {
        let module = match self.modules.as_slice() {
            [module] => module,
            _ => {
                return Err(Error::UnsupportedImage(format!(
                    "only single-module assemblies can be written ('{}' has {})",
                    self.name,
                    self.modules.len()
                )))
            }
        };

        let fresh_baseline;
        let (mut writer, baseline, attribute_rows) = match &self.image {
            Some(image) => (
                ImageWriter::from_image(image),
                &image.baseline,
                image.attribute_rows.as_slice(),
            ),
            None => {
                fresh_baseline = ImageWriter::empty_baseline();
                (ImageWriter::fresh(), &fresh_baseline, &[][..])
            }
        };
        let baseline_module = baseline
            .modules
            .first()
            .ok_or_else(|| Error::MalformedImage(String::from("loaded assembly has no module")))?;

        writer.write_identity(self, baseline, module, baseline_module)?;
        writer.write_references(&self.references, &baseline.references)?;
        writer.write_type_refs(&module.type_refs, &baseline_module.type_refs)?;
        writer.write_member_refs(&module.member_refs, &baseline_module.member_refs)?;
        writer.write_types(&module.types, &baseline_module.types)?;
        writer.write_attributes(
            &self.custom_attributes,
            &baseline.custom_attributes,
            attribute_rows,
        )?;

        let row_counts = writer.tables.row_counts();
        let bytes = writer.finish(module)?;
        Ok((bytes, row_counts))
    }

    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Assembly, Error> {
        Assembly::from_bytes(&fs::read(path)?)
    }

    /// Save the assembly to disk
    ///
    /// The assembly is fully serialized before the file is touched, so a serialization failure
    /// never leaves a truncated file behind.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Decodes the model out of the tables of an image
struct ModelReader<'a> {
    pe: &'a PeImage,
    tables: &'a TableStream,
    strings: &'a StringHeap,
    blobs: &'a BlobHeap,
}

impl<'a> ModelReader<'a> {
    fn string(&self, offset: u32) -> Result<String, Error> {
        self.strings.get(offset)
    }

    fn blob(&self, offset: u32) -> Result<Vec<u8>, Error> {
        self.blobs.get(offset).map(<[u8]>::to_vec)
    }

    fn read_assembly(&self, user_strings: UserStringHeap) -> Result<(Assembly, Vec<u32>), Error> {
        let row = self.tables.row(ids::ASSEMBLY, 1).map_err(|_| {
            Error::UnsupportedImage(String::from("module has no assembly manifest"))
        })?;
        let mut assembly = Assembly::new(self.string(row[7])?);
        assembly.version = [row[1] as u16, row[2] as u16, row[3] as u16, row[4] as u16];

        for row in self.tables.rows(ids::ASSEMBLY_REF) {
            assembly.references.push(AssemblyRef {
                version: [row[0] as u16, row[1] as u16, row[2] as u16, row[3] as u16],
                flags: row[4],
                public_key_or_token: self.blob(row[5])?,
                name: self.string(row[6])?,
                culture: self.string(row[7])?,
                hash_value: self.blob(row[8])?,
            });
        }

        let module = self.read_module(user_strings)?;
        let mut attribute_rows = vec![];
        let assembly_parent = CodedIndex::HasCustomAttribute.encode(Token::from_parts(ids::ASSEMBLY, 1))?;
        for (idx, row) in self.tables.rows(ids::CUSTOM_ATTRIBUTE).iter().enumerate() {
            if row[0] != assembly_parent {
                continue;
            }
            let constructor = CodedIndex::CustomAttributeType.decode(row[1])?;
            assembly.custom_attributes.push(CustomAttribute {
                type_name: attribute_type_name(&module, constructor)?,
                constructor,
                blob: self.blob(row[2])?,
            });
            attribute_rows.push(idx as u32 + 1);
        }

        assembly.modules.push(module);
        Ok((assembly, attribute_rows))
    }

    fn read_module(&self, user_strings: UserStringHeap) -> Result<Module, Error> {
        let row = self
            .tables
            .row(ids::MODULE, 1)
            .map_err(|_| Error::MalformedImage(String::from("no module row")))?;
        let mut module = Module::new(self.string(row[1])?);
        module.user_strings = user_strings;
        module.types.clear();

        module.type_refs = self.read_type_refs()?;
        for row in self.tables.rows(ids::MEMBER_REF) {
            module.member_refs.push(MemberRef {
                parent: CodedIndex::MemberRefParent.decode(row[0])?,
                name: self.string(row[1])?,
                signature: MemberSig::parse(self.blobs.get(row[2])?)?,
            });
        }
        module.types = self.read_types()?;
        Ok(module)
    }

    fn read_type_refs(&self) -> Result<Vec<TypeRef>, Error> {
        let mut type_refs = vec![];
        for row in self.tables.rows(ids::TYPE_REF) {
            let scope = CodedIndex::ResolutionScope.decode(row[0])?;
            let scope = if scope.is_null() {
                ResolutionScope::Module
            } else {
                match scope.table_id() {
                    ids::MODULE => ResolutionScope::Module,
                    ids::MODULE_REF => ResolutionScope::ModuleRef(scope.row()),
                    ids::ASSEMBLY_REF => ResolutionScope::AssemblyRef(
                        scope.row().checked_sub(1).ok_or(Error::InvalidToken(scope))? as u16,
                    ),
                    _ => ResolutionScope::Nested(scope),
                }
            };
            type_refs.push(TypeRef {
                scope,
                name: self.string(row[1])?,
                namespace: self.string(row[2])?,
                enclosing: None,
            });
        }

        // Nested references name their enclosing reference, which may be nested itself
        for idx in 0..type_refs.len() {
            let mut chain = vec![];
            let mut scope = type_refs[idx].scope;
            while let ResolutionScope::Nested(parent) = scope {
                let parent = parent
                    .row()
                    .checked_sub(1)
                    .and_then(|parent| type_refs.get(parent as usize))
                    .filter(|_| chain.len() < type_refs.len())
                    .ok_or(Error::InvalidToken(parent))?;
                chain.push(parent.full_name_without_enclosing());
                scope = parent.scope;
            }
            if !chain.is_empty() {
                chain.reverse();
                type_refs[idx].enclosing = Some(chain.join("/"));
            }
        }
        Ok(type_refs)
    }

    fn read_types(&self) -> Result<Vec<TypeDef>, Error> {
        let type_rows = self.tables.rows(ids::TYPE_DEF);
        let method_count = self.tables.len(ids::METHOD_DEF);
        let param_count = self.tables.len(ids::PARAM);

        let mut types = Vec::with_capacity(type_rows.len());
        for (idx, row) in type_rows.iter().enumerate() {
            let first = row[5];
            let end = type_rows
                .get(idx + 1)
                .map(|next| next[5])
                .unwrap_or(method_count + 1);
            if first == 0 || end < first || end > method_count + 1 {
                return Err(Error::MalformedImage(format!(
                    "type {} has method list {}..{} (of {} methods)",
                    idx + 1,
                    first,
                    end,
                    method_count
                )));
            }

            let mut methods = Vec::with_capacity((end - first) as usize);
            for method_row in first..end {
                methods.push(self.read_method(method_row, param_count)?);
            }
            types.push(TypeDef {
                flags: TypeAttributes::from_bits_truncate(row[0]),
                name: self.string(row[1])?,
                namespace: self.string(row[2])?,
                enclosing: None,
                extends: CodedIndex::TypeDefOrRef.decode(row[3])?,
                methods,
            });
        }

        let enclosing: HashMap<u32, u32> = self
            .tables
            .rows(ids::NESTED_CLASS)
            .iter()
            .map(|row| (row[0], row[1]))
            .collect();
        let mut names = Vec::with_capacity(types.len());
        for idx in 0..types.len() {
            let mut chain = vec![];
            let mut current = idx as u32 + 1;
            while let Some(outer) = enclosing.get(&current) {
                let outer_type = outer
                    .checked_sub(1)
                    .and_then(|outer| types.get(outer as usize))
                    .filter(|_| chain.len() < types.len())
                    .ok_or(Error::InvalidToken(Token::from_parts(ids::TYPE_DEF, *outer)))?;
                chain.push(outer_type.full_name());
                current = *outer;
            }
            chain.reverse();
            names.push(if chain.is_empty() {
                None
            } else {
                Some(chain.join("/"))
            });
        }
        for (type_def, enclosing) in types.iter_mut().zip(names) {
            type_def.enclosing = enclosing;
        }
        Ok(types)
    }

    fn read_method(&self, row_idx: u32, param_count: u32) -> Result<MethodDef, Error> {
        let row = self.tables.row(ids::METHOD_DEF, row_idx)?;
        let impl_flags = MethodImplAttributes::from_bits_truncate(row[1] as u16);
        let signature = MethodSig::parse(self.blobs.get(row[4])?)?;

        let body = if row[0] != 0 && impl_flags.is_il() {
            Some(RawBody::parse(self.pe.read_from(row[0])?)?)
        } else {
            None
        };

        let first_param = row[5];
        let end_param = self
            .tables
            .rows(ids::METHOD_DEF)
            .get(row_idx as usize)
            .map(|next| next[5])
            .unwrap_or(param_count + 1);
        let mut param_names = vec![String::new(); signature.param_count()];
        for param_row in first_param..end_param.max(first_param) {
            let param = self.tables.row(ids::PARAM, param_row)?;
            let sequence = param[1] as usize;
            if let Some(slot) = sequence.checked_sub(1).and_then(|idx| param_names.get_mut(idx)) {
                *slot = self.string(param[2])?;
            }
        }

        Ok(MethodDef {
            flags: MethodAttributes::from_bits_truncate(row[2] as u16),
            impl_flags,
            name: self.string(row[3])?,
            signature,
            param_names,
            body,
            sequence_points: vec![],
            local_scopes: vec![],
        })
    }
}

impl TypeRef {
    fn full_name_without_enclosing(&self) -> String {
        TypeRef {
            enclosing: None,
            ..self.clone()
        }
        .full_name()
    }
}

/// Full name of the type declaring an attribute constructor
fn attribute_type_name(module: &Module, constructor: Token) -> Result<String, Error> {
    match constructor.table_id() {
        ids::METHOD_DEF => Ok(module.declaring_type(constructor)?.full_name()),
        ids::MEMBER_REF => {
            let parent = module.member_ref(constructor)?.parent;
            match parent.table_id() {
                ids::TYPE_REF => Ok(module.type_ref(parent)?.full_name()),
                ids::TYPE_DEF => Ok(module.type_def(parent)?.full_name()),
                // generic attribute instantiations have no plain name
                _ => Ok(String::new()),
            }
        }
        _ => Err(Error::InvalidToken(constructor)),
    }
}

/// Accumulates the rewritten tables, heaps, and section contents
struct ImageWriter {
    pe: PeImage,
    cli_header: Vec<u8>,
    root: MetadataRoot,
    tables: TableStream,
    strings: StringHeap,
    blobs: BlobHeap,
    guids: GuidHeap,

    /// Contents of the new section: the CLI header, then method bodies
    section: Vec<u8>,
    section_rva: u32,
}

impl ImageWriter {
    fn from_image(image: &LoadedImage) -> ImageWriter {
        let pe = image.pe.clone();
        let section_rva = pe.next_section_rva();
        ImageWriter {
            pe,
            cli_header: image.cli_header.clone(),
            root: image.root.clone(),
            tables: image.tables.clone(),
            strings: image.strings.clone(),
            blobs: image.blobs.clone(),
            guids: image.guids.clone(),
            section: vec![0; CLI_HEADER_SIZE],
            section_rva,
        }
    }

    /// Writer for an assembly built from scratch: empty `Module` and `Assembly` rows that
    /// [`ImageWriter::write_identity`] fills in
    fn fresh() -> ImageWriter {
        let pe = PeImage::skeleton();
        let section_rva = pe.next_section_rva();

        let mut cli_header = vec![0; CLI_HEADER_SIZE];
        LittleEndian::write_u32(&mut cli_header[0..], CLI_HEADER_SIZE as u32);
        LittleEndian::write_u16(&mut cli_header[4..], 2);
        LittleEndian::write_u16(&mut cli_header[6..], 5);
        LittleEndian::write_u32(&mut cli_header[16..], 0x01);

        let mut guids = GuidHeap::new();
        let mvid = guids.add([0; 16]);
        let mut tables = TableStream::new(TableStream::ASSEMBLY_SORTED, RowCounts::empty());
        tables.push(ids::MODULE, vec![0, 0, mvid, 0, 0]);
        tables.push(ids::ASSEMBLY, vec![0x8004, 0, 0, 0, 0, 0, 0, 0, 0]);

        ImageWriter {
            pe,
            cli_header,
            root: MetadataRoot::new(RUNTIME_VERSION),
            tables,
            strings: StringHeap::new(),
            blobs: BlobHeap::new(),
            guids,
            section: vec![0; CLI_HEADER_SIZE],
            section_rva,
        }
    }

    /// What the rows of [`ImageWriter::fresh`] amount to
    fn empty_baseline() -> Assembly {
        let mut module = Module::new("");
        module.types.clear();
        let mut assembly = Assembly::new("");
        assembly.modules.push(module);
        assembly
    }

    fn string(&mut self, value: &str) -> u32 {
        self.strings.add(value)
    }

    fn blob(&mut self, value: &[u8]) -> Result<u32, Error> {
        self.blobs.add(value)
    }

    fn write_identity(
        &mut self,
        assembly: &Assembly,
        baseline: &Assembly,
        module: &Module,
        baseline_module: &Module,
    ) -> Result<(), Error> {
        if module.name != baseline_module.name {
            let name = self.string(&module.name);
            self.tables.row_mut(ids::MODULE, 1)?[1] = name;
        }
        if assembly.name != baseline.name || assembly.version != baseline.version {
            let name = self.string(&assembly.name);
            let row = self.tables.row_mut(ids::ASSEMBLY, 1)?;
            for (column, part) in row[1..5].iter_mut().zip(assembly.version) {
                *column = part as u32;
            }
            row[7] = name;
        }
        Ok(())
    }

    fn write_references(
        &mut self,
        references: &[AssemblyRef],
        baseline: &[AssemblyRef],
    ) -> Result<(), Error> {
        if references.len() < baseline.len() {
            return Err(Error::UnsupportedImage(String::from(
                "assembly references can't be removed",
            )));
        }
        for (idx, reference) in references.iter().enumerate() {
            if baseline.get(idx) == Some(reference) {
                continue;
            }
            let row = vec![
                reference.version[0] as u32,
                reference.version[1] as u32,
                reference.version[2] as u32,
                reference.version[3] as u32,
                reference.flags,
                self.blob(&reference.public_key_or_token)?,
                self.string(&reference.name),
                self.string(&reference.culture),
                self.blob(&reference.hash_value)?,
            ];
            self.put_row(ids::ASSEMBLY_REF, idx, baseline.len(), row)?;
        }
        Ok(())
    }

    fn write_type_refs(&mut self, type_refs: &[TypeRef], baseline: &[TypeRef]) -> Result<(), Error> {
        if type_refs.len() < baseline.len() {
            return Err(Error::UnsupportedImage(String::from(
                "type references can't be removed",
            )));
        }
        for (idx, type_ref) in type_refs.iter().enumerate() {
            if baseline.get(idx) == Some(type_ref) {
                continue;
            }
            let scope = match type_ref.scope {
                ResolutionScope::Module => Token::from_parts(ids::MODULE, 1),
                ResolutionScope::ModuleRef(row) => Token::from_parts(ids::MODULE_REF, row),
                ResolutionScope::AssemblyRef(idx) => {
                    Token::from_parts(ids::ASSEMBLY_REF, idx as u32 + 1)
                }
                ResolutionScope::Nested(parent) => parent,
            };
            let row = vec![
                CodedIndex::ResolutionScope.encode(scope)?,
                self.string(&type_ref.name),
                self.string(&type_ref.namespace),
            ];
            self.put_row(ids::TYPE_REF, idx, baseline.len(), row)?;
        }
        Ok(())
    }

    fn write_member_refs(
        &mut self,
        member_refs: &[MemberRef],
        baseline: &[MemberRef],
    ) -> Result<(), Error> {
        if member_refs.len() < baseline.len() {
            return Err(Error::UnsupportedImage(String::from(
                "member references can't be removed",
            )));
        }
        for (idx, member_ref) in member_refs.iter().enumerate() {
            if baseline.get(idx) == Some(member_ref) {
                continue;
            }
            let signature = member_ref.signature.to_bytes()?;
            let row = vec![
                CodedIndex::MemberRefParent.encode(member_ref.parent)?,
                self.string(&member_ref.name),
                self.blob(&signature)?,
            ];
            self.put_row(ids::MEMBER_REF, idx, baseline.len(), row)?;
        }
        Ok(())
    }

    fn write_types(&mut self, types: &[TypeDef], baseline: &[TypeDef]) -> Result<(), Error> {
        if types.len() < baseline.len() {
            return Err(Error::UnsupportedImage(String::from(
                "type definitions can't be removed",
            )));
        }

        let mut method_row = 0;
        for (idx, (type_def, original)) in types.iter().zip(baseline).enumerate() {
            if type_def.methods.len() != original.methods.len() {
                return Err(Error::UnsupportedImage(format!(
                    "methods can't be added to or removed from existing type '{}'",
                    type_def.full_name()
                )));
            }
            if type_def.enclosing != original.enclosing {
                return Err(Error::UnsupportedImage(format!(
                    "type '{}' was moved to another enclosing type",
                    type_def.full_name()
                )));
            }
            let type_row = idx as u32 + 1;
            if type_def.flags != original.flags
                || type_def.name != original.name
                || type_def.namespace != original.namespace
                || type_def.extends != original.extends
            {
                let columns = [
                    type_def.flags.bits(),
                    self.string(&type_def.name),
                    self.string(&type_def.namespace),
                    CodedIndex::TypeDefOrRef.encode(type_def.extends)?,
                ];
                self.tables.row_mut(ids::TYPE_DEF, type_row)?[..4].copy_from_slice(&columns);
            }

            for (method, original) in type_def.methods.iter().zip(&original.methods) {
                method_row += 1;
                self.rewrite_method(method_row, method, original)?;
            }
        }

        for type_def in &types[baseline.len()..] {
            if type_def.enclosing.is_some() {
                return Err(Error::UnsupportedImage(format!(
                    "new nested type '{}' can't be written",
                    type_def.full_name()
                )));
            }
            let row = vec![
                type_def.flags.bits(),
                self.string(&type_def.name),
                self.string(&type_def.namespace),
                CodedIndex::TypeDefOrRef.encode(type_def.extends)?,
                self.tables.len(ids::FIELD) + 1,
                self.tables.len(ids::METHOD_DEF) + 1,
            ];
            self.tables.push(ids::TYPE_DEF, row);
            for method in &type_def.methods {
                self.append_method(method)?;
            }
        }
        Ok(())
    }

    fn rewrite_method(
        &mut self,
        row_idx: u32,
        method: &MethodDef,
        original: &MethodDef,
    ) -> Result<(), Error> {
        if method.param_names != original.param_names {
            return Err(Error::UnsupportedImage(format!(
                "parameters of existing method '{}' can't be renamed",
                method.name
            )));
        }
        if method.flags != original.flags
            || method.impl_flags != original.impl_flags
            || method.name != original.name
            || method.signature != original.signature
        {
            let signature = method.signature.to_bytes()?;
            let columns = [
                method.impl_flags.bits() as u32,
                method.flags.bits() as u32,
                self.string(&method.name),
                self.blob(&signature)?,
            ];
            self.tables.row_mut(ids::METHOD_DEF, row_idx)?[1..5].copy_from_slice(&columns);
        }
        if method.body != original.body {
            let rva = match &method.body {
                Some(body) => self.add_body(body)?,
                None => 0,
            };
            self.tables.row_mut(ids::METHOD_DEF, row_idx)?[0] = rva;
        }
        Ok(())
    }

    fn append_method(&mut self, method: &MethodDef) -> Result<(), Error> {
        let param_list = self.tables.len(ids::PARAM) + 1;
        for (idx, name) in method.param_names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let name = self.string(name);
            self.tables.push(ids::PARAM, vec![0, idx as u32 + 1, name]);
        }
        let rva = match &method.body {
            Some(body) => self.add_body(body)?,
            None => 0,
        };
        let signature = method.signature.to_bytes()?;
        let row = vec![
            rva,
            method.impl_flags.bits() as u32,
            method.flags.bits() as u32,
            self.string(&method.name),
            self.blob(&signature)?,
            param_list,
        ];
        self.tables.push(ids::METHOD_DEF, row);
        Ok(())
    }

    /// Lay out a method body in the new section, returning its RVA
    fn add_body(&mut self, body: &RawBody) -> Result<u32, Error> {
        pad_to(&mut self.section, 4);
        let rva = self.section_rva + self.section.len() as u32;
        self.section.extend_from_slice(&body.to_bytes()?);
        Ok(rva)
    }

    fn write_attributes(
        &mut self,
        attributes: &[CustomAttribute],
        baseline: &[CustomAttribute],
        rows: &[u32],
    ) -> Result<(), Error> {
        if attributes.len() < baseline.len() {
            return Err(Error::UnsupportedImage(String::from(
                "assembly attributes can't be removed",
            )));
        }
        let parent = CodedIndex::HasCustomAttribute.encode(Token::from_parts(ids::ASSEMBLY, 1))?;

        // Rewrite in place first: inserting shifts the rows after the insertion point
        for ((attribute, original), row) in attributes.iter().zip(baseline).zip(rows) {
            if attribute != original {
                let columns = [
                    CodedIndex::CustomAttributeType.encode(attribute.constructor)?,
                    self.blob(&attribute.blob)?,
                ];
                self.tables.row_mut(ids::CUSTOM_ATTRIBUTE, *row)?[1..3].copy_from_slice(&columns);
            }
        }
        for attribute in &attributes[baseline.len()..] {
            let row = vec![
                parent,
                CodedIndex::CustomAttributeType.encode(attribute.constructor)?,
                self.blob(&attribute.blob)?,
            ];
            self.tables.insert_sorted(ids::CUSTOM_ATTRIBUTE, row);
        }
        Ok(())
    }

    /// Replace row `idx` (0-based) if it existed before, append it otherwise
    fn put_row(
        &mut self,
        table: u8,
        idx: usize,
        existing: usize,
        row: Vec<u32>,
    ) -> Result<(), Error> {
        if idx < existing {
            *self.tables.row_mut(table, idx as u32 + 1)? = row;
        } else {
            self.tables.push(table, row);
        }
        Ok(())
    }

    fn finish(mut self, module: &Module) -> Result<Vec<u8>, Error> {
        let heaps = HeapSizes {
            strings: self.strings.len(),
            guids: self.guids.len(),
            blobs: self.blobs.len(),
        };
        let tables = self.tables.to_bytes(heaps)?;
        let strings = padded(self.strings.as_bytes(), 4);
        let user_strings = padded(module.user_strings.as_bytes(), 4);
        let guids = self.guids.as_bytes().to_vec();
        let blobs = padded(self.blobs.as_bytes(), 4);

        self.root.set_stream("#~", tables);
        self.root.set_stream("#Strings", strings);
        self.root.set_stream("#US", user_strings);
        self.root.set_stream("#GUID", guids);
        self.root.set_stream("#Blob", blobs);
        let metadata = self.root.to_bytes()?;

        pad_to(&mut self.section, 4);
        let metadata_rva = self.section_rva + self.section.len() as u32;
        self.section.extend_from_slice(&metadata);

        let mut cli_header = self.cli_header;
        LittleEndian::write_u32(&mut cli_header[8..], metadata_rva);
        LittleEndian::write_u32(&mut cli_header[12..], metadata.len() as u32);
        let flags = LittleEndian::read_u32(&cli_header[16..]);
        LittleEndian::write_u32(&mut cli_header[16..], flags & !CLI_FLAG_STRONG_NAME_SIGNED);
        self.section[..CLI_HEADER_SIZE].copy_from_slice(&cli_header);

        log::debug!(
            "Writing {} bytes of metadata and code in a new '{}' section at 0x{:X}",
            self.section.len(),
            SECTION_NAME,
            self.section_rva
        );
        self.pe.with_section(SECTION_NAME, &self.section, 0)
    }
}
