//! Locating referenced assemblies and walking type ancestry across them
//!
//! Whether a type is a hook host depends on its declared base types, which usually live in other
//! assemblies (a game script derives from `UnityEngine.MonoBehaviour`, defined in
//! `UnityEngine.dll`). The resolver loads those assemblies on demand from a list of search
//! directories and keeps them around for the rest of the batch.

use crate::metadata::{Assembly, Module, ResolutionScope, Table, Token, TypeDef};
use crate::Error;
use elsa::map::FrozenMap;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use typed_arena::Arena;

pub struct ResolverArenas {
    assemblies: Arena<Assembly>,
}

impl ResolverArenas {
    pub fn new() -> Self {
        ResolverArenas {
            assemblies: Arena::new(),
        }
    }
}

impl Default for ResolverArenas {
    fn default() -> Self {
        ResolverArenas::new()
    }
}

/// Resolves assembly names to loaded assemblies
///
/// Loaded assemblies are never modified or unloaded, so references into them stay valid for as
/// long as the arenas do. Names that could not be found are remembered too, so a missing
/// assembly is only searched for once.
pub struct AssemblyResolver<'r> {
    arenas: &'r ResolverArenas,
    search_directories: Vec<PathBuf>,
    loaded: FrozenMap<String, &'r Assembly>,
    missing: RefCell<HashSet<String>>,
}

impl<'r> AssemblyResolver<'r> {
    /// File extensions tried (in order) when looking for an assembly
    pub const EXTENSIONS: [&'static str; 2] = ["dll", "exe"];

    pub fn new(arenas: &'r ResolverArenas) -> Self {
        AssemblyResolver {
            arenas,
            search_directories: vec![],
            loaded: FrozenMap::new(),
            missing: RefCell::new(HashSet::new()),
        }
    }

    pub fn add_search_directory<P: AsRef<Path>>(&mut self, directory: P) {
        let directory = directory.as_ref().to_path_buf();
        if !self.search_directories.contains(&directory) {
            self.search_directories.push(directory);
        }
    }

    pub fn search_directories(&self) -> &[PathBuf] {
        &self.search_directories
    }

    /// Make an already loaded assembly resolvable by its name
    pub fn register(&'r self, assembly: Assembly) -> &'r Assembly {
        let assembly = &*self.arenas.assemblies.alloc(assembly);
        self.loaded.insert(assembly.name.clone(), assembly);
        assembly
    }

    /// Find an assembly by name, loading it from the search directories if needed
    pub fn resolve(&'r self, name: &str) -> Option<&'r Assembly> {
        if let Some(assembly) = self.loaded.get(name) {
            return Some(assembly);
        }
        if self.missing.borrow().contains(name) {
            return None;
        }

        for directory in &self.search_directories {
            for extension in Self::EXTENSIONS {
                let path = directory.join(format!("{}.{}", name, extension));
                if !path.is_file() {
                    continue;
                }
                match Assembly::read_from_path(&path) {
                    Ok(assembly) => {
                        log::debug!("Resolved '{}' to {}", name, path.display());
                        return Some(self.register(assembly));
                    }
                    Err(err) => log::warn!("Could not load {}: {}", path.display(), err),
                }
            }
        }

        log::debug!("Could not resolve assembly '{}'", name);
        self.missing.borrow_mut().insert(name.to_owned());
        None
    }

    /// Full names of the declared base types of a type, nearest first
    ///
    /// Base types in the same module are followed through their `TypeDef` tokens and base types
    /// in other assemblies through the resolver. The walk stops early (without an error) at a
    /// base type whose assembly can't be found, after having reported that base type's name.
    pub fn ancestry<'a>(
        &'r self,
        assembly: &'a Assembly,
        module: &'a Module,
        type_def: &'a TypeDef,
    ) -> Result<Vec<String>, Error>
    where
        'r: 'a,
    {
        let mut ancestors: Vec<String> = vec![];
        let mut dont_revisit: HashSet<(String, String)> = HashSet::new();
        dont_revisit.insert((assembly.name.clone(), type_def.full_name()));

        let mut current_assembly: &'a Assembly = assembly;
        let mut current_module: &'a Module = module;
        let mut next: Token = type_def.extends;

        while !next.is_null() {
            let base: &'a TypeDef = match next.table() {
                Table::TypeDef => current_module.type_def(next)?,
                Table::TypeRef => {
                    let type_ref = current_module.type_ref(next)?;
                    let name = type_ref.full_name();
                    match defining_scope(current_module, next)? {
                        ResolutionScope::Module => current_module
                            .find_type(&name)
                            .ok_or(Error::InvalidToken(next))?,
                        ResolutionScope::AssemblyRef(idx) => {
                            let reference = current_assembly
                                .references
                                .get(idx as usize)
                                .ok_or(Error::InvalidToken(next))?;
                            let found = self.resolve(&reference.name).and_then(|external| {
                                external
                                    .find_type(&name)
                                    .map(|(module, type_def)| (external, module, type_def))
                            });
                            match found {
                                Some((external, module, type_def)) => {
                                    current_assembly = external;
                                    current_module = module;
                                    type_def
                                }
                                None => {
                                    log::debug!(
                                        "Ancestry stops at '{}' (not found in '{}')",
                                        name,
                                        reference.name
                                    );
                                    if !ancestors.contains(&name) {
                                        ancestors.push(name);
                                    }
                                    break;
                                }
                            }
                        }
                        ResolutionScope::ModuleRef(_) | ResolutionScope::Nested(_) => {
                            log::debug!("Ancestry stops at '{}' (in another module)", name);
                            if !ancestors.contains(&name) {
                                ancestors.push(name);
                            }
                            break;
                        }
                    }
                }
                Table::TypeSpec => {
                    log::debug!("Ancestry stops at instantiated base type {:?}", next);
                    break;
                }
                _ => return Err(Error::InvalidToken(next)),
            };

            let name = base.full_name();
            if !dont_revisit.insert((current_assembly.name.clone(), name.clone())) {
                log::warn!("Cyclic base types around '{}'", name);
                break;
            }
            ancestors.push(name);
            next = base.extends;
        }

        Ok(ancestors)
    }
}

/// Scope of the outermost type a type reference is nested in
fn defining_scope(module: &Module, token: Token) -> Result<ResolutionScope, Error> {
    let mut scope = module.type_ref(token)?.scope;
    for _ in 0..module.type_refs.len() {
        match scope {
            ResolutionScope::Nested(outer) => scope = module.type_ref(outer)?.scope,
            resolved => return Ok(resolved),
        }
    }
    Err(Error::InvalidToken(token))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::TypeRef;

    /// `UnityEngine.Object <- Component <- Behaviour <- MonoBehaviour`
    fn engine() -> Assembly {
        let mut module = Module::new("UnityEngine.dll");
        let mut extends = Token::NULL;
        for name in ["Object", "Component", "Behaviour", "MonoBehaviour"] {
            module.types.push(TypeDef::new("UnityEngine", name, extends));
            extends = Token::from_index(Table::TypeDef, module.types.len() - 1);
        }
        let mut assembly = Assembly::new("UnityEngine");
        assembly.modules.push(module);
        assembly
    }

    /// `Game.Player <- Game.Actor <- [UnityEngine]UnityEngine.MonoBehaviour`
    fn game() -> Assembly {
        let mut assembly = Assembly::new("Game");
        let engine_ref = assembly.import_reference("UnityEngine");
        let mut module = Module::new("Game.dll");
        let mono_behaviour = module.import_type(
            ResolutionScope::AssemblyRef(engine_ref),
            "UnityEngine",
            "MonoBehaviour",
        );
        module.types.push(TypeDef::new("Game", "Actor", mono_behaviour));
        module.types.push(TypeDef::new(
            "Game",
            "Player",
            Token::from_index(Table::TypeDef, 1),
        ));
        assembly.modules.push(module);
        assembly
    }

    fn player_ancestry<'a>(resolver: &'a AssemblyResolver<'a>, game: &Assembly) -> Vec<String> {
        let module = &game.modules[0];
        resolver.ancestry(game, module, &module.types[2]).unwrap()
    }

    #[test]
    fn ancestry_crosses_into_resolved_assemblies() {
        let dir = tempfile::tempdir().unwrap();
        engine()
            .save_to_path(dir.path().join("UnityEngine.dll"))
            .unwrap();

        let arenas = ResolverArenas::new();
        let mut resolver = AssemblyResolver::new(&arenas);
        resolver.add_search_directory(dir.path());
        resolver.add_search_directory(dir.path());
        assert_eq!(resolver.search_directories().len(), 1);

        let game = game();
        assert_eq!(
            player_ancestry(&resolver, &game),
            vec![
                "Game.Actor",
                "UnityEngine.MonoBehaviour",
                "UnityEngine.Behaviour",
                "UnityEngine.Component",
                "UnityEngine.Object",
            ]
        );
    }

    #[test]
    fn ancestry_stops_at_missing_assemblies() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let game = game();
        assert_eq!(
            player_ancestry(&resolver, &game),
            vec!["Game.Actor", "UnityEngine.MonoBehaviour"]
        );
        assert!(resolver.resolve("UnityEngine").is_none());
    }

    #[test]
    fn registered_assemblies_resolve_without_files() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        resolver.register(engine());
        let engine = resolver.resolve("UnityEngine").unwrap();
        // four types and `<Module>`
        assert_eq!(engine.modules[0].types.len(), 5);
    }

    #[test]
    fn unreadable_assemblies_count_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UnityEngine.dll"), b"garbage").unwrap();
        let arenas = ResolverArenas::new();
        let mut resolver = AssemblyResolver::new(&arenas);
        resolver.add_search_directory(dir.path());
        assert!(resolver.resolve("UnityEngine").is_none());
    }

    #[test]
    fn bad_base_tokens_are_errors() {
        let mut game = game();
        game.modules[0].types[2].extends = Token::from_index(Table::TypeDef, 17);
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let module = &game.modules[0];
        match resolver.ancestry(&game, module, &module.types[2]) {
            Err(Error::InvalidToken(_)) => (),
            other => panic!("expected an invalid token error, got {:?}", other),
        }

        game.modules[0].type_refs.push(TypeRef {
            scope: ResolutionScope::AssemblyRef(5),
            namespace: String::from("Elsewhere"),
            name: String::from("Base"),
            enclosing: None,
        });
        game.modules[0].types[2].extends = Token::from_index(Table::TypeRef, 1);
        let module = &game.modules[0];
        assert!(resolver.ancestry(&game, module, &module.types[2]).is_err());
    }

    #[test]
    fn cyclic_bases_terminate() {
        let mut module = Module::new("Loop.dll");
        module
            .types
            .push(TypeDef::new("", "A", Token::from_index(Table::TypeDef, 2)));
        module
            .types
            .push(TypeDef::new("", "B", Token::from_index(Table::TypeDef, 1)));
        let mut assembly = Assembly::new("Loop");
        assembly.modules.push(module);

        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let module = &assembly.modules[0];
        assert_eq!(
            resolver.ancestry(&assembly, module, &module.types[1]).unwrap(),
            vec!["B"]
        );
    }

    #[test]
    fn nested_bases_resolve_through_their_outer_type() {
        let mut engine = engine();
        let mut inner = TypeDef::new("", "Inner", Token::from_index(Table::TypeDef, 4));
        inner.enclosing = Some(String::from("UnityEngine.Object"));
        engine.modules[0].types.push(inner);
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        resolver.register(engine);

        let mut game = game();
        let module = &mut game.modules[0];
        let outer = module.import_type(ResolutionScope::AssemblyRef(0), "UnityEngine", "Object");
        module.type_refs.push(TypeRef {
            scope: ResolutionScope::Nested(outer),
            namespace: String::new(),
            name: String::from("Inner"),
            enclosing: Some(String::from("UnityEngine.Object")),
        });
        module.types[1].extends = Token::from_index(Table::TypeRef, module.type_refs.len() - 1);

        let module = &game.modules[0];
        assert_eq!(
            resolver.ancestry(&game, module, &module.types[1]).unwrap(),
            vec![
                "UnityEngine.Object/Inner",
                "UnityEngine.MonoBehaviour",
                "UnityEngine.Behaviour",
                "UnityEngine.Component",
                "UnityEngine.Object",
            ]
        );
    }
}
