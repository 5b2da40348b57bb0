use crate::metadata::image::LoadedImage;
use crate::metadata::{
    MemberSig, MethodAttributes, MethodImplAttributes, MethodSig, RawBody, Table, Token,
    TypeAttributes, UserStringHeap,
};
use crate::symbols::{LocalScope, SequencePoint};
use crate::Error;

/// In-memory view of an assembly
///
/// Only the parts of the metadata that the instrumentation needs are modelled. Everything is
/// mutable so that the walker can add the processed marker, import callees, intern span labels,
/// and swap in rewritten method bodies. An assembly that was read from an image remembers that
/// image, and writing it back only re-encodes what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub name: String,
    pub version: [u16; 4],

    /// Referenced assemblies (the targets of `ResolutionScope::AssemblyRef`)
    pub references: Vec<AssemblyRef>,

    /// Assembly-level custom attributes
    pub custom_attributes: Vec<CustomAttribute>,

    /// Modules, the first one being the main module
    pub modules: Vec<Module>,

    pub(crate) image: Option<Box<LoadedImage>>,
}

impl Assembly {
    pub fn new(name: impl Into<String>) -> Assembly {
        Assembly {
            name: name.into(),
            version: [0; 4],
            references: vec![],
            custom_attributes: vec![],
            modules: vec![],
            image: None,
        }
    }

    pub fn main_module(&self) -> Option<&Module> {
        self.modules.first()
    }

    pub fn main_module_mut(&mut self) -> Option<&mut Module> {
        self.modules.first_mut()
    }

    /// Is there an assembly-level attribute of this type?
    pub fn has_attribute(&self, type_full_name: &str) -> bool {
        self.custom_attributes
            .iter()
            .any(|attr| attr.type_name == type_full_name)
    }

    /// Find a type definition anywhere in the assembly by its full name
    pub fn find_type(&self, full_name: &str) -> Option<(&Module, &TypeDef)> {
        self.modules.iter().find_map(|module| {
            module
                .find_type(full_name)
                .map(|type_def| (module, type_def))
        })
    }

    /// Index of an assembly reference, adding it if there isn't one with the same name
    pub fn import_reference(&mut self, reference: impl Into<AssemblyRef>) -> u16 {
        let reference = reference.into();
        match self
            .references
            .iter()
            .position(|existing| existing.name == reference.name)
        {
            Some(idx) => idx as u16,
            None => {
                self.references.push(reference);
                (self.references.len() - 1) as u16
            }
        }
    }

    /// Index of the first reference whose name is one of `names`
    pub fn find_reference(&self, names: &[&str]) -> Option<u16> {
        names.iter().find_map(|name| {
            self.references
                .iter()
                .position(|reference| reference.name == *name)
                .map(|idx| idx as u16)
        })
    }
}

/// Reference to another assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    pub name: String,
    pub version: [u16; 4],
    pub flags: u32,
    pub public_key_or_token: Vec<u8>,
    pub culture: String,
    pub hash_value: Vec<u8>,
}

impl AssemblyRef {
    /// Reference by name alone (version `0.0.0.0`, no culture, no public key)
    pub fn new(name: impl Into<String>) -> AssemblyRef {
        AssemblyRef {
            name: name.into(),
            version: [0; 4],
            flags: 0,
            public_key_or_token: vec![],
            culture: String::new(),
            hash_value: vec![],
        }
    }

    /// Reference that matches a loaded assembly's name and version
    pub fn to(assembly: &Assembly) -> AssemblyRef {
        AssemblyRef {
            version: assembly.version,
            ..AssemblyRef::new(assembly.name.as_str())
        }
    }
}

impl From<&str> for AssemblyRef {
    fn from(name: &str) -> AssemblyRef {
        AssemblyRef::new(name)
    }
}

/// Custom attribute
///
/// The blob holds the encoded constructor arguments (see ECMA-335, Partition II, 23.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAttribute {
    /// Full name of the attribute type (the type declaring the constructor)
    pub type_name: String,

    /// `MethodDef` or `MemberRef` token of the constructor
    pub constructor: Token,

    pub blob: Vec<u8>,
}

impl CustomAttribute {
    /// Arguments of a constructor that takes none (the `0x0001` prolog and zero named arguments)
    pub const NO_ARGUMENTS: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
}

/// Where a type reference is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionScope {
    /// Defined in the same module
    Module,

    /// Defined in another module of the same assembly (1-based `ModuleRef` row)
    ModuleRef(u32),

    /// Defined in another assembly (index into [`Assembly::references`])
    AssemblyRef(u16),

    /// Nested in the type another `TypeRef` refers to
    Nested(Token),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub scope: ResolutionScope,
    pub namespace: String,
    pub name: String,

    /// Full name of the enclosing type, for nested types
    pub enclosing: Option<String>,
}

impl TypeRef {
    pub fn full_name(&self) -> String {
        full_name(self.enclosing.as_deref(), &self.namespace, &self.name)
    }
}

/// Reference to a member defined in some other type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// `TypeRef`, `TypeDef`, `ModuleRef`, `MethodDef`, or `TypeSpec` token of the parent
    pub parent: Token,
    pub name: String,
    pub signature: MemberSig,
}

/// A module: the unit that owns type definitions, references, and the user-string heap
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub type_refs: Vec<TypeRef>,
    pub member_refs: Vec<MemberRef>,

    /// `#US` heap (targets of `ldstr`)
    pub user_strings: UserStringHeap,

    /// Type definitions in table order, nested types included. The first one is always the
    /// `<Module>` type that holds global members.
    pub types: Vec<TypeDef>,
}

impl Module {
    pub const GLOBAL_TYPE: &'static str = "<Module>";

    pub fn new(name: impl Into<String>) -> Module {
        let mut global = TypeDef::new("", Module::GLOBAL_TYPE, Token::NULL);
        global.flags = TypeAttributes::empty();
        Module {
            name: name.into(),
            type_refs: vec![],
            member_refs: vec![],
            user_strings: UserStringHeap::new(),
            types: vec![global],
        }
    }

    pub fn type_ref(&self, token: Token) -> Result<&TypeRef, Error> {
        token
            .index_in(Table::TypeRef)
            .and_then(|idx| self.type_refs.get(idx))
            .ok_or(Error::InvalidToken(token))
    }

    pub fn type_def(&self, token: Token) -> Result<&TypeDef, Error> {
        token
            .index_in(Table::TypeDef)
            .and_then(|idx| self.types.get(idx))
            .ok_or(Error::InvalidToken(token))
    }

    pub fn member_ref(&self, token: Token) -> Result<&MemberRef, Error> {
        token
            .index_in(Table::MemberRef)
            .and_then(|idx| self.member_refs.get(idx))
            .ok_or(Error::InvalidToken(token))
    }

    pub fn user_string(&self, token: Token) -> Result<String, Error> {
        if token.table() != Table::UserString {
            return Err(Error::InvalidToken(token));
        }
        self.user_strings
            .get(token.row())
            .map_err(|_| Error::InvalidToken(token))
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|ty| ty.full_name() == full_name)
    }

    /// `TypeDef` token of a type, by its full name
    pub fn type_token(&self, full_name: &str) -> Option<Token> {
        self.types
            .iter()
            .position(|ty| ty.full_name() == full_name)
            .map(|idx| Token::from_index(Table::TypeDef, idx))
    }

    /// Intern a string literal, returning the token to use with `ldstr`
    pub fn add_user_string(&mut self, value: &str) -> Result<Token, Error> {
        let offset = match self.user_strings.find(value) {
            Some(offset) => offset,
            None => self.user_strings.add(value)?,
        };
        Ok(Token::from_parts(Table::UserString.tag(), offset))
    }

    /// Get or add a type reference
    pub fn import_type(&mut self, scope: ResolutionScope, namespace: &str, name: &str) -> Token {
        let existing = self
            .type_refs
            .iter()
            .position(|tr| tr.scope == scope && tr.namespace == namespace && tr.name == name);
        let idx = match existing {
            Some(idx) => idx,
            None => {
                self.type_refs.push(TypeRef {
                    scope,
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                    enclosing: None,
                });
                self.type_refs.len() - 1
            }
        };
        Token::from_index(Table::TypeRef, idx)
    }

    /// Get or add a member reference
    pub fn import_member(&mut self, member: MemberRef) -> Token {
        let idx = match self.member_refs.iter().position(|mr| *mr == member) {
            Some(idx) => idx,
            None => {
                self.member_refs.push(member);
                self.member_refs.len() - 1
            }
        };
        Token::from_index(Table::MemberRef, idx)
    }

    /// `MethodDef` token of a method (rows are numbered through the types in order)
    pub fn method_token(&self, type_index: usize, method_index: usize) -> Token {
        let preceding: usize = self.types[..type_index]
            .iter()
            .map(|ty| ty.methods.len())
            .sum();
        Token::from_index(Table::MethodDef, preceding + method_index)
    }

    /// Methods in `MethodDef` table order
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.types.iter().flat_map(|ty| ty.methods.iter())
    }

    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut MethodDef> {
        self.types.iter_mut().flat_map(|ty| ty.methods.iter_mut())
    }

    /// Type declaring the method with a `MethodDef` token
    pub fn declaring_type(&self, token: Token) -> Result<&TypeDef, Error> {
        let mut remaining = token
            .index_in(Table::MethodDef)
            .ok_or(Error::InvalidToken(token))?;
        for ty in &self.types {
            if remaining < ty.methods.len() {
                return Ok(ty);
            }
            remaining -= ty.methods.len();
        }
        Err(Error::InvalidToken(token))
    }

    /// Look up a method by its `MethodDef` token
    pub fn method_mut(&mut self, token: Token) -> Result<&mut MethodDef, Error> {
        let idx = token
            .index_in(Table::MethodDef)
            .ok_or(Error::InvalidToken(token))?;
        self.methods_mut().nth(idx).ok_or(Error::InvalidToken(token))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub flags: TypeAttributes,
    pub namespace: String,
    pub name: String,

    /// Full name of the enclosing type, for nested types
    pub enclosing: Option<String>,

    /// Declared base type (`TypeDef`, `TypeRef`, or `TypeSpec` token, null for interfaces and
    /// `System.Object`)
    pub extends: Token,

    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    /// Public type with no methods yet
    pub fn new(namespace: &str, name: &str, extends: Token) -> TypeDef {
        TypeDef {
            flags: TypeAttributes::PUBLIC,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            enclosing: None,
            extends,
            methods: vec![],
        }
    }

    /// Full name, with nested types written `Outer/Inner`
    pub fn full_name(&self) -> String {
        full_name(self.enclosing.as_deref(), &self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub flags: MethodAttributes,
    pub impl_flags: MethodImplAttributes,
    pub name: String,
    pub signature: MethodSig,
    pub param_names: Vec<String>,
    pub body: Option<RawBody>,

    /// Sequence points from the debug symbols, if any were loaded
    pub sequence_points: Vec<SequencePoint>,

    /// Local scopes from the debug symbols, if any were loaded
    pub local_scopes: Vec<LocalScope>,
}

impl MethodDef {
    /// Public method with IL implementation and unnamed parameters
    pub fn new(name: &str, signature: MethodSig, body: Option<RawBody>) -> MethodDef {
        MethodDef {
            flags: MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG,
            impl_flags: MethodImplAttributes::empty(),
            name: name.to_owned(),
            param_names: vec![String::new(); signature.param_count()],
            signature,
            body,
            sequence_points: vec![],
            local_scopes: vec![],
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.signature.param_count()
    }

    /// Does this method have IL we can rewrite?
    pub fn has_body(&self) -> bool {
        self.body.is_some()
            && !self
                .flags
                .intersects(MethodAttributes::ABSTRACT | MethodAttributes::PINVOKE_IMPL)
            && self.impl_flags.is_il()
            && !self.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL)
    }
}

fn full_name(enclosing: Option<&str>, namespace: &str, name: &str) -> String {
    let local = if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{}.{}", namespace, name)
    };
    match enclosing {
        Some(outer) => format!("{}/{}", outer, local),
        None => local,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::TypeSig;

    fn method(name: &str) -> MethodDef {
        MethodDef {
            flags: MethodAttributes::PUBLIC,
            impl_flags: MethodImplAttributes::empty(),
            name: name.to_owned(),
            signature: MethodSig::nullary(),
            param_names: vec![],
            body: None,
            sequence_points: vec![],
            local_scopes: vec![],
        }
    }

    fn type_def(name: &str, methods: Vec<MethodDef>) -> TypeDef {
        TypeDef {
            methods,
            ..TypeDef::new("Game", name, Token::NULL)
        }
    }

    #[test]
    fn method_tokens_run_across_types() {
        let mut module = Module::new("Game.dll");
        module
            .types
            .push(type_def("Player", vec![method("Update"), method("Start")]));
        module.types.push(type_def("Enemy", vec![method("LateUpdate")]));

        let token = module.method_token(2, 0);
        assert_eq!(token, Token(0x0600_0003));
        assert_eq!(module.method_mut(token).unwrap().name, "LateUpdate");
        assert_eq!(module.declaring_type(token).unwrap().name, "Enemy");
        assert!(module.method_mut(Token(0x0600_0004)).is_err());
        assert_eq!(module.methods().count(), 3);
    }

    #[test]
    fn imports_are_deduplicated() {
        let mut module = Module::new("Game.dll");
        let first = module.add_user_string("Profilator->Game.Player.Update").unwrap();
        let second = module.add_user_string("Profilator->Game.Player.Update").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Token(0x7000_0001));
        assert_eq!(module.user_string(first).unwrap(), "Profilator->Game.Player.Update");
        assert!(module.user_string(Token(0x0100_0001)).is_err());

        let profiler = module.import_type(
            ResolutionScope::AssemblyRef(0),
            "UnityEngine.Profiling",
            "Profiler",
        );
        let again = module.import_type(
            ResolutionScope::AssemblyRef(0),
            "UnityEngine.Profiling",
            "Profiler",
        );
        assert_eq!(profiler, again);
        assert_eq!(module.type_ref(profiler).unwrap().full_name(), "UnityEngine.Profiling.Profiler");

        let mut assembly = Assembly::new("Game");
        assert_eq!(assembly.import_reference("UnityEngine"), 0);
        let mut versioned = AssemblyRef::new("UnityEngine");
        versioned.version = [1, 0, 0, 0];
        assert_eq!(assembly.import_reference(versioned), 0);
        assert_eq!(assembly.references.len(), 1);
        assert_eq!(assembly.find_reference(&["mscorlib", "UnityEngine"]), Some(0));
        assert_eq!(assembly.find_reference(&["netstandard"]), None);
    }

    #[test]
    fn full_names() {
        let mut ty = type_def("Player", vec![]);
        assert_eq!(ty.full_name(), "Game.Player");
        ty.namespace.clear();
        assert_eq!(ty.full_name(), "Player");
        ty.enclosing = Some(String::from("Game.World"));
        assert_eq!(ty.full_name(), "Game.World/Player");

        let module = Module::new("Game.dll");
        assert_eq!(module.types[0].full_name(), "<Module>");
        assert_eq!(module.type_token("<Module>"), Some(Token(0x0200_0001)));
    }

    #[test]
    fn abstract_methods_have_no_body() {
        let mut update = method("Update");
        update.body = Some(RawBody::new(vec![0x2A]));
        assert!(update.has_body());

        update.flags |= MethodAttributes::ABSTRACT;
        assert!(!update.has_body());
    }

    #[test]
    fn parameter_names_follow_the_signature() {
        let method = MethodDef::new(
            "LateUpdate",
            MethodSig::new(TypeSig::Void, vec![TypeSig::Float32]),
            None,
        );
        assert_eq!(method.param_names, vec![String::new()]);
        assert_eq!(method.parameter_count(), 1);
    }
}
