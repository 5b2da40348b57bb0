use crate::cil::{Instruction, MethodBody, Opcode};
use crate::inject::{
    span_label, CalleeRef, FrameHookSelector, HookSelector, Settings, SpanInjector,
};
use crate::metadata::{
    Assembly, AssemblyRef, CustomAttribute, MemberRef, MethodAttributes, MethodDef, MethodSig,
    Module, ResolutionScope, Table, Token, TypeAttributes, TypeDef, TypeSig,
};
use crate::resolve::AssemblyResolver;
use crate::Error;

/// Names the core library goes by, most common first
const CORE_LIBRARIES: [&str; 4] = [
    "mscorlib",
    "netstandard",
    "System.Runtime",
    "System.Private.CoreLib",
];

/// Public key token of `mscorlib`
const MSCORLIB_PUBLIC_KEY_TOKEN: [u8; 8] = [0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89];

/// Result of walking one assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkOutcome {
    /// The assembly already carried the processed marker and was left alone
    AlreadyProcessed,

    /// The marker was added and the listed spans were injected (possibly none)
    Processed { labels: Vec<String> },
}

/// Method selected for instrumentation
struct Site {
    module: usize,
    type_def: usize,
    method: usize,
    label: String,
}

/// Finds the hook methods of an assembly and wraps each of them in a span
pub struct AssemblyWalker<S = FrameHookSelector> {
    pub settings: Settings,
    pub selector: S,
}

impl AssemblyWalker<FrameHookSelector> {
    pub fn with_settings(settings: Settings) -> Self {
        AssemblyWalker::new(settings, FrameHookSelector::new())
    }
}

impl<S: HookSelector> AssemblyWalker<S> {
    pub fn new(settings: Settings, selector: S) -> Self {
        AssemblyWalker { settings, selector }
    }

    /// Instrument an assembly, returning whether it changed
    ///
    /// An assembly that isn't marked as processed always changes (it gets marked), even when no
    /// method qualifies.
    pub fn process<'r>(
        &self,
        assembly: &mut Assembly,
        resolver: &'r AssemblyResolver<'r>,
    ) -> Result<bool, Error> {
        Ok(matches!(
            self.walk(assembly, resolver)?,
            WalkOutcome::Processed { .. }
        ))
    }

    /// Same as [`AssemblyWalker::process`], but reporting which spans were injected
    pub fn walk<'r>(
        &self,
        assembly: &mut Assembly,
        resolver: &'r AssemblyResolver<'r>,
    ) -> Result<WalkOutcome, Error> {
        if assembly.has_attribute(&self.settings.marker_attribute) {
            log::info!("Assembly '{}' is already processed", assembly.name);
            return Ok(WalkOutcome::AlreadyProcessed);
        }
        add_marker(assembly, &self.settings.marker_attribute)?;

        let sites = self.select_sites(assembly, resolver)?;

        let mut labels = Vec::with_capacity(sites.len());
        // Sites come grouped by module, and callees are only imported into modules that need them
        let mut current: Option<(usize, SpanInjector)> = None;
        for site in sites {
            let injector = match current {
                Some((module, injector)) if module == site.module => injector,
                _ => {
                    let injector = self.import_callees(assembly, site.module, resolver);
                    current = Some((site.module, injector));
                    injector
                }
            };

            let module = &mut assembly.modules[site.module];
            let label = module.add_user_string(&site.label)?;
            let method = &mut module.types[site.type_def].methods[site.method];
            let raw = match &method.body {
                Some(raw) => raw,
                None => continue,
            };

            let mut body = MethodBody::decode(raw, &method.sequence_points)?;
            injector.inject(&mut body, label);
            let (raw, sequence_points, offsets) = body.encode_with_offsets()?;
            method.body = Some(raw);
            method.sequence_points = sequence_points;
            for scope in &mut method.local_scopes {
                // Scopes opening at the start of the method also cover the new prologue
                let start = match scope.start_offset {
                    0 => 0,
                    start => offsets.map(start),
                };
                let end = offsets.map(scope.start_offset.saturating_add(scope.length));
                scope.start_offset = start;
                scope.length = end.saturating_sub(start);
            }

            log::debug!("Injected span '{}'", site.label);
            labels.push(site.label);
        }

        log::info!(
            "Instrumented {} method(s) in '{}'",
            labels.len(),
            assembly.name
        );
        Ok(WalkOutcome::Processed { labels })
    }

    /// Decide which methods to instrument, without touching anything
    fn select_sites<'r>(
        &self,
        assembly: &Assembly,
        resolver: &'r AssemblyResolver<'r>,
    ) -> Result<Vec<Site>, Error> {
        let mut sites = vec![];
        for (module_idx, module) in assembly.modules.iter().enumerate() {
            for (type_idx, type_def) in module.types.iter().enumerate() {
                if self.settings.is_excluded_type(&type_def.name) {
                    log::debug!("Skipping excluded type '{}'", type_def.full_name());
                    continue;
                }

                let ancestry = resolver.ancestry(assembly, module, type_def)?;
                if !self.selector.is_hook_host(&ancestry) {
                    continue;
                }

                let type_name = type_def.full_name();
                for (method_idx, method) in type_def.methods.iter().enumerate() {
                    if !self.selector.is_hook(method) {
                        continue;
                    }
                    sites.push(Site {
                        module: module_idx,
                        type_def: type_idx,
                        method: method_idx,
                        label: span_label(&self.settings.label_prefix, &type_name, &method.name),
                    });
                }
            }
        }
        Ok(sites)
    }

    /// Add references to the begin and end methods to a module
    fn import_callees<'r>(
        &self,
        assembly: &mut Assembly,
        module: usize,
        resolver: &'r AssemblyResolver<'r>,
    ) -> SpanInjector {
        let begin_sig = MethodSig::new(TypeSig::Void, vec![TypeSig::String]);
        let begin = import_callee(assembly, module, &self.settings.begin, begin_sig, resolver);
        let end = import_callee(
            assembly,
            module,
            &self.settings.end,
            MethodSig::nullary(),
            resolver,
        );
        log::debug!(
            "Imported {} as {:?} and {} as {:?} into '{}'",
            self.settings.begin,
            begin,
            self.settings.end,
            end,
            assembly.modules[module].name
        );
        SpanInjector::new(begin, end)
    }
}

fn import_callee<'r>(
    assembly: &mut Assembly,
    module: usize,
    callee: &CalleeRef,
    signature: MethodSig,
    resolver: &'r AssemblyResolver<'r>,
) -> Token {
    let parent = if callee.assembly == assembly.name {
        local_type(&mut assembly.modules[module], callee)
    } else {
        // Bind to the version that is actually around when there is one
        let reference = match resolver.resolve(&callee.assembly) {
            Some(found) => AssemblyRef::to(found),
            None => AssemblyRef::new(callee.assembly.as_str()),
        };
        let reference = assembly.import_reference(reference);
        assembly.modules[module].import_type(
            ResolutionScope::AssemblyRef(reference),
            &callee.namespace,
            &callee.type_name,
        )
    };

    assembly.modules[module].import_member(MemberRef {
        parent,
        name: callee.method.clone(),
        signature: signature.into(),
    })
}

/// Mark an assembly as processed with an attribute of type `full_name`
///
/// The attribute type is defined in the main module (deriving from `System.Attribute`) unless
/// that module already has one, so the marker doesn't need any assembly besides the core library.
fn add_marker(assembly: &mut Assembly, full_name: &str) -> Result<(), Error> {
    let existing = assembly.main_module().and_then(|module| {
        let type_idx = module.types.iter().position(|ty| ty.full_name() == full_name)?;
        Some((type_idx, module.types[type_idx].methods.iter().position(is_constructor)))
    });
    let constructor = match existing {
        Some((type_idx, Some(method_idx))) => {
            assembly.modules[0].method_token(type_idx, method_idx)
        }
        Some((_, None)) => {
            return Err(Error::UnsupportedImage(format!(
                "marker type '{}' has no parameterless constructor",
                full_name
            )))
        }
        None => define_marker(assembly, full_name)?,
    };

    assembly.custom_attributes.push(CustomAttribute {
        type_name: full_name.to_owned(),
        constructor,
        blob: CustomAttribute::NO_ARGUMENTS.to_vec(),
    });
    Ok(())
}

fn is_constructor(method: &MethodDef) -> bool {
    method.name == ".ctor"
        && method.signature.has_this()
        && method.parameter_count() == 0
        && !method.flags.contains(MethodAttributes::STATIC)
}

/// Define `full_name` as a sealed attribute class, returning its constructor
fn define_marker(assembly: &mut Assembly, full_name: &str) -> Result<Token, Error> {
    let corlib = match assembly.find_reference(&CORE_LIBRARIES) {
        Some(idx) => idx,
        None => assembly.import_reference(AssemblyRef {
            version: [4, 0, 0, 0],
            public_key_or_token: MSCORLIB_PUBLIC_KEY_TOKEN.to_vec(),
            ..AssemblyRef::new(CORE_LIBRARIES[0])
        }),
    };
    let module = assembly.main_module_mut().ok_or_else(|| {
        Error::UnsupportedImage(String::from("assembly has no modules to mark"))
    })?;

    let attribute =
        module.import_type(ResolutionScope::AssemblyRef(corlib), "System", "Attribute");
    let base_constructor = module.import_member(MemberRef {
        parent: attribute,
        name: String::from(".ctor"),
        signature: MethodSig::instance(TypeSig::Void, vec![]).into(),
    });

    let mut body = MethodBody::new();
    body.push(Instruction::simple(Opcode::Ldarg_0));
    body.push(Instruction::call(base_constructor));
    body.push(Instruction::ret());
    let (raw, _) = body.encode()?;

    let signature = MethodSig::instance(TypeSig::Void, vec![]);
    let mut constructor = MethodDef::new(".ctor", signature, Some(raw));
    constructor.flags = MethodAttributes::PUBLIC
        | MethodAttributes::HIDE_BY_SIG
        | MethodAttributes::SPECIAL_NAME
        | MethodAttributes::RT_SPECIAL_NAME;

    let (namespace, name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
    let mut marker = TypeDef::new(namespace, name, attribute);
    marker.flags =
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT;
    marker.methods.push(constructor);
    module.types.push(marker);

    log::debug!("Defined marker attribute '{}'", full_name);
    Ok(module.method_token(module.types.len() - 1, 0))
}

/// Callee declared in the assembly being processed
fn local_type(module: &mut Module, callee: &CalleeRef) -> Token {
    let full_name = callee.type_full_name();
    match module.types.iter().position(|ty| ty.full_name() == full_name) {
        Some(idx) => Token::from_index(Table::TypeDef, idx),
        None => module.import_type(ResolutionScope::Module, &callee.namespace, &callee.type_name),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::Operand;
    use crate::metadata::{MemberSig, RawBody};
    use crate::resolve::ResolverArenas;
    use crate::symbols::{LocalScope, SequencePoint};

    const MARKER: &str = Settings::DEFAULT_MARKER_ATTRIBUTE;

    fn update(name: &str, code: Vec<u8>) -> MethodDef {
        MethodDef::new(name, MethodSig::nullary(), Some(RawBody::new(code)))
    }

    /// `Game` with `Player` and `RamjetProfilerHooks` deriving from `MonoBehaviour`, and a plain
    /// `Util` class (types 1 to 3, after `<Module>`)
    fn game() -> Assembly {
        let mut assembly = Assembly::new("Game");
        let engine = assembly.import_reference("UnityEngine");
        let mut module = Module::new("Game.dll");
        let mono_behaviour = module.import_type(
            ResolutionScope::AssemblyRef(engine),
            "UnityEngine",
            "MonoBehaviour",
        );

        let mut player = TypeDef::new("Game", "Player", mono_behaviour);
        player.methods.push(update("Update", vec![0x2A]));
        player.methods.push(update("Start", vec![0x2A]));
        player.methods.push(MethodDef::new(
            "LateUpdate",
            MethodSig::new(TypeSig::Void, vec![TypeSig::Float32]),
            Some(RawBody::new(vec![0x2A])),
        ));
        // ldarg.0; brfalse.s IL_0004; ret; IL_0004: nop; ret
        player
            .methods
            .push(update("FixedUpdate", vec![0x02, 0x2C, 0x01, 0x2A, 0x00, 0x2A]));
        module.types.push(player);

        let mut hooks = TypeDef::new("Game", "RamjetProfilerHooks", mono_behaviour);
        hooks.methods.push(update("Update", vec![0x2A]));
        module.types.push(hooks);

        let mut util = TypeDef::new("Game", "Util", Token::NULL);
        util.methods.push(update("Update", vec![0x2A]));
        module.types.push(util);

        assembly.modules.push(module);
        assembly
    }

    fn walker() -> AssemblyWalker {
        AssemblyWalker::with_settings(Settings::new())
    }

    fn decoded(module: &Module, type_idx: usize, method_idx: usize) -> MethodBody {
        let method = &module.types[type_idx].methods[method_idx];
        MethodBody::decode(method.body.as_ref().unwrap(), &method.sequence_points).unwrap()
    }

    #[test]
    fn selected_hooks_get_spans() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let original = game();
        let mut assembly = original.clone();

        let outcome = walker().walk(&mut assembly, &resolver).unwrap();
        assert_eq!(
            outcome,
            WalkOutcome::Processed {
                labels: vec![
                    String::from("Profilator->Game.Player.Update"),
                    String::from("Profilator->Game.Player.FixedUpdate"),
                ]
            }
        );
        assert!(assembly.has_attribute(MARKER));
        let names: Vec<&str> = assembly.references.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["UnityEngine", "mscorlib"]);

        let module = &assembly.modules[0];
        let original_module = &original.modules[0];
        assert_eq!(module.member_refs.len(), 3);
        assert_eq!(module.member_refs[0].name, ".ctor");
        assert_eq!(module.member_refs[1].name, "BeginSample");
        assert_eq!(
            module.member_refs[1].signature,
            MemberSig::from(MethodSig::new(TypeSig::Void, vec![TypeSig::String]))
        );
        assert_eq!(module.member_refs[2].name, "EndSample");
        let profiler = module.type_ref(module.member_refs[1].parent).unwrap();
        assert_eq!(profiler.full_name(), "UnityEngine.Profiling.Profiler");

        let body = decoded(module, 1, 0);
        let layout = body.layout();
        match &body[layout[0]].operand {
            Operand::String(label) => assert_eq!(
                module.user_string(*label).unwrap(),
                "Profilator->Game.Player.Update"
            ),
            other => panic!("expected a label operand, got {:?}", other),
        }
        let begin = Token::from_index(Table::MemberRef, 1);
        assert_eq!(body[layout[1]], Instruction::call(begin));

        let fixed_update = decoded(module, 1, 3);
        let returns = fixed_update
            .instructions()
            .filter(|(_, insn)| insn.opcode == Opcode::Ret)
            .count();
        assert_eq!(returns, 1);

        // Start, LateUpdate(float), the excluded type, and the non-behaviour are untouched
        for (type_idx, method_idx) in [(1, 1), (1, 2), (2, 0), (3, 0)] {
            assert_eq!(
                module.types[type_idx].methods[method_idx],
                original_module.types[type_idx].methods[method_idx]
            );
        }
    }

    #[test]
    fn the_marker_type_is_defined_in_the_main_module() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        walker().process(&mut assembly, &resolver).unwrap();

        let module = &assembly.modules[0];
        assert_eq!(module.types.len(), 5);
        let marker = &module.types[4];
        assert_eq!(marker.full_name(), MARKER);
        assert!(marker.flags.contains(TypeAttributes::SEALED));
        let base = module.type_ref(marker.extends).unwrap();
        assert_eq!(base.full_name(), "System.Attribute");
        assert_eq!(base.scope, ResolutionScope::AssemblyRef(1));
        assert!(is_constructor(&marker.methods[0]));

        // Player has four methods, the other two types one each
        let attribute = &assembly.custom_attributes[0];
        assert_eq!(attribute.constructor, Token::from_index(Table::MethodDef, 6));
        assert_eq!(attribute.constructor, module.method_token(4, 0));
        assert_eq!(attribute.blob, CustomAttribute::NO_ARGUMENTS.to_vec());

        let ctor = decoded(module, 4, 0);
        let base_ctor = Token::from_index(Table::MemberRef, 0);
        let opcodes: Vec<Opcode> = ctor.instructions().map(|(_, insn)| insn.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Ldarg_0, Opcode::Call, Opcode::Ret]);
        assert_eq!(ctor[ctor.layout()[1]], Instruction::call(base_ctor));
    }

    #[test]
    fn marked_assemblies_survive_saving() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        walker().process(&mut assembly, &resolver).unwrap();

        let mut reloaded = Assembly::from_bytes(&assembly.to_bytes().unwrap()).unwrap();
        assert!(reloaded.has_attribute(MARKER));
        assert!(!walker().process(&mut reloaded, &resolver).unwrap());
    }

    #[test]
    fn existing_marker_types_are_reused() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        let mut marker = TypeDef::new("", MARKER, Token::NULL);
        marker.methods.push(MethodDef::new(
            ".ctor",
            MethodSig::instance(TypeSig::Void, vec![]),
            Some(RawBody::new(vec![0x2A])),
        ));
        assembly.modules[0].types.push(marker);

        walker().process(&mut assembly, &resolver).unwrap();
        assert_eq!(assembly.modules[0].types.len(), 5);
        assert_eq!(
            assembly.custom_attributes[0].constructor,
            assembly.modules[0].method_token(4, 0)
        );
        assert_eq!(assembly.references.len(), 1);
    }

    #[test]
    fn marker_types_without_a_constructor_are_errors() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0]
            .types
            .push(TypeDef::new("", MARKER, Token::NULL));
        assert!(matches!(
            walker().process(&mut assembly, &resolver),
            Err(Error::UnsupportedImage(_))
        ));
    }

    #[test]
    fn marked_assemblies_are_left_alone() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();

        assert!(walker().process(&mut assembly, &resolver).unwrap());
        let once = assembly.clone();
        assert!(!walker().process(&mut assembly, &resolver).unwrap());
        assert_eq!(assembly, once);
        assert_eq!(
            assembly
                .custom_attributes
                .iter()
                .filter(|attr| attr.type_name == MARKER)
                .count(),
            1
        );
    }

    #[test]
    fn no_hooks_still_marks() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0].types.remove(1);

        let outcome = walker().walk(&mut assembly, &resolver).unwrap();
        assert_eq!(outcome, WalkOutcome::Processed { labels: vec![] });
        assert!(assembly.has_attribute(MARKER));
        // only the base attribute constructor
        assert_eq!(assembly.modules[0].member_refs.len(), 1);
        assert!(assembly.modules[0].user_strings.is_empty());
    }

    #[test]
    fn hooks_returning_values_are_skipped() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        let mono_behaviour = Token::from_index(Table::TypeRef, 0);
        let mut enemy = TypeDef::new("Game", "Enemy", mono_behaviour);
        // ldc.i4.1; ret
        enemy.methods.push(MethodDef::new(
            "Update",
            MethodSig::new(TypeSig::Int32, vec![]),
            Some(RawBody::new(vec![0x17, 0x2A])),
        ));
        assembly.modules[0].types.push(enemy);
        let original = assembly.modules[0].types[4].clone();

        match walker().walk(&mut assembly, &resolver).unwrap() {
            WalkOutcome::Processed { labels } => {
                assert!(labels.iter().all(|label| !label.contains("Enemy")))
            }
            other => panic!("expected the assembly to be processed, got {:?}", other),
        }
        assert_eq!(assembly.modules[0].types[4], original);
    }

    #[test]
    fn sequence_points_are_remapped() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0].types[1].methods[3].sequence_points =
            vec![SequencePoint::new(0, 1, 20, 9), SequencePoint::new(4, 1, 22, 9)];

        walker().process(&mut assembly, &resolver).unwrap();
        let points = &assembly.modules[0].types[1].methods[3].sequence_points;
        // ldstr (5) and call (5) push everything along, and the early `ret` became a `leave.s`
        assert_eq!(points[0].il_offset, 10);
        assert_eq!(points[1].il_offset, 15);
    }

    #[test]
    fn local_scopes_are_remapped() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0].types[1].methods[3].local_scopes = vec![
            LocalScope {
                row: 1,
                start_offset: 0,
                length: 6,
            },
            LocalScope {
                row: 2,
                start_offset: 4,
                length: 2,
            },
        ];

        walker().process(&mut assembly, &resolver).unwrap();
        let method = &assembly.modules[0].types[1].methods[3];
        let code_len = method.body.as_ref().unwrap().code.len() as u32;
        let scopes = &method.local_scopes;
        assert_eq!((scopes[0].start_offset, scopes[0].length), (0, code_len));
        assert_eq!(scopes[1].start_offset, 15);
        assert_eq!(scopes[1].start_offset + scopes[1].length, code_len);
        assert_eq!(scopes[1].row, 2);
    }

    #[test]
    fn custom_callees_in_the_same_assembly() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0]
            .types
            .push(TypeDef::new("Game", "Tracer", Token::NULL));

        let mut settings = Settings::new();
        settings.begin = CalleeRef::parse("[Game]Game.Tracer::Enter").unwrap();
        settings.end = CalleeRef::parse("[Game]Game.Tracer::Exit").unwrap();
        AssemblyWalker::with_settings(settings)
            .process(&mut assembly, &resolver)
            .unwrap();

        let module = &assembly.modules[0];
        assert!(assembly.find_reference(&["Game"]).is_none());
        assert_eq!(module.member_refs[1].name, "Enter");
        assert_eq!(
            module.member_refs[1].parent,
            Token::from_index(Table::TypeDef, 4)
        );
    }

    #[test]
    fn new_references_take_the_resolved_version() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut tracing = Assembly::new("Tracing");
        tracing.version = [1, 2, 0, 0];
        resolver.register(tracing);

        let mut settings = Settings::new();
        settings.begin = CalleeRef::parse("[Tracing]Tracing.Spans::Begin").unwrap();
        settings.end = CalleeRef::parse("[Elsewhere]Tracing.Spans::End").unwrap();
        let mut assembly = game();
        AssemblyWalker::with_settings(settings)
            .process(&mut assembly, &resolver)
            .unwrap();

        let tracing = assembly.find_reference(&["Tracing"]).unwrap();
        assert_eq!(assembly.references[tracing as usize].version, [1, 2, 0, 0]);
        let elsewhere = assembly.find_reference(&["Elsewhere"]).unwrap();
        assert_eq!(assembly.references[elsewhere as usize].version, [0; 4]);
    }

    #[test]
    fn broken_bodies_fail_the_assembly() {
        let arenas = ResolverArenas::new();
        let resolver = AssemblyResolver::new(&arenas);
        let mut assembly = game();
        assembly.modules[0].types[1].methods[0].body = Some(RawBody::new(vec![0x20, 0x01]));
        assert!(matches!(
            walker().process(&mut assembly, &resolver),
            Err(Error::TruncatedCode { offset: 0 })
        ));
    }
}
