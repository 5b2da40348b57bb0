use ilspan::batch::{AssemblyOutcome, Batch};
use ilspan::cil::{MethodBody, Opcode};
use ilspan::inject::{AssemblyWalker, Settings};
use ilspan::metadata::{
    Assembly, MethodDef, MethodSig, Module, RawBody, ResolutionScope, Table, Token, TypeDef,
};
use ilspan::symbols::{SequencePoint, SymbolFile, SymbolFormat};
use ilspan::Error;
use std::fs;
use std::path::{Path, PathBuf};

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

/// `Game.Player : Game.Actor : UnityEngine.Behaviour` with an `Update` that has two returns
fn game() -> Assembly {
    let mut assembly = Assembly::new("Game");
    let engine = assembly.import_reference("UnityEngine");
    let mut module = Module::new("Game.dll");
    let behaviour =
        module.import_type(ResolutionScope::AssemblyRef(engine), "UnityEngine", "MonoBehaviour");

    module.types.push(TypeDef::new("Game", "Actor", behaviour));
    let mut player = TypeDef::new("Game", "Player", Token::from_index(Table::TypeDef, 1));
    // IL_0000: ldarg.0
    // IL_0001: brfalse.s IL_0004
    // IL_0003: ret
    // IL_0004: nop
    // IL_0005: ret
    player.methods.push(MethodDef::new(
        "Update",
        MethodSig::nullary(),
        Some(RawBody::new(vec![0x02, 0x2C, 0x01, 0x2A, 0x00, 0x2A])),
    ));
    player.methods.push(MethodDef::new(
        "Awake",
        MethodSig::nullary(),
        Some(RawBody::new(vec![0x2A])),
    ));
    module.types.push(player);

    assembly.modules.push(module);
    assembly
}

const PLAYER_SOURCE: &str = "Assets/Scripts/Player.cs";

/// `Game.dll` and its portable PDB, with two sequence points in `Player.Update`
fn game_with_symbols() -> (Vec<u8>, Vec<u8>) {
    let mut game = game();
    game.modules[0].types[2].methods[0].sequence_points =
        vec![SequencePoint::new(0, 1, 12, 9), SequencePoint::new(4, 1, 14, 9)];
    let (assembly, row_counts) = game.encode().unwrap();
    let symbols = SymbolFile::new(&[PLAYER_SOURCE])
        .unwrap()
        .rewrite(&game, row_counts)
        .unwrap();
    (assembly, symbols)
}

struct Project {
    _dir: tempfile::TempDir,
    managed: PathBuf,
    scripts: PathBuf,
}

/// Engine assemblies in `Managed/`, game assemblies in `ScriptAssemblies/`
fn project() -> Project {
    let dir = tempfile::tempdir().unwrap();
    let managed = dir.path().join("Managed");
    let scripts = dir.path().join("ScriptAssemblies");
    fs::create_dir_all(&managed).unwrap();
    fs::create_dir_all(&scripts).unwrap();

    engine()
        .save_to_path(managed.join("UnityEngine.dll"))
        .unwrap();
    let (assembly, symbols) = game_with_symbols();
    fs::write(scripts.join("Game.dll"), assembly).unwrap();
    fs::write(scripts.join("Game.pdb"), symbols).unwrap();
    game()
        .save_to_path(scripts.join("Game.Editor.dll"))
        .unwrap();
    fs::write(scripts.join("Broken.dll"), b"MZ\x90\x00 not an assembly").unwrap();

    Project {
        _dir: dir,
        managed,
        scripts,
    }
}

fn batch(managed: &Path) -> Batch {
    let mut batch = Batch::new(AssemblyWalker::with_settings(Settings::new()));
    batch.search_directories.push(managed.to_path_buf());
    batch
}

#[test]
fn instruments_game_assemblies() {
    let project = project();
    let paths = vec![
        project.scripts.join("Broken.dll"),
        project.scripts.join("Game.dll"),
        project.scripts.join("Game.Editor.dll"),
    ];
    let editor_before = fs::read(&paths[2]).unwrap();
    let broken_before = fs::read(&paths[0]).unwrap();

    let report = batch(&project.managed).run(&paths);
    assert_eq!(report.outcomes.len(), 3);
    assert!(matches!(report.outcomes[0].1, AssemblyOutcome::Failed(_)));
    match &report.outcomes[1].1 {
        AssemblyOutcome::Instrumented { methods } => {
            assert_eq!(methods, &vec![String::from("Profilator->Game.Player.Update")])
        }
        other => panic!("expected Game.dll to be instrumented, got {:?}", other),
    }
    assert!(matches!(report.outcomes[2].1, AssemblyOutcome::Excluded));
    assert_eq!(report.instrumented_methods(), 1);
    assert_eq!(report.failures().count(), 1);

    // Untouched files stay as they were
    assert_eq!(fs::read(&paths[0]).unwrap(), broken_before);
    assert_eq!(fs::read(&paths[2]).unwrap(), editor_before);

    let assembly = Assembly::read_from_path(&paths[1]).unwrap();
    assert!(assembly.has_attribute(Settings::DEFAULT_MARKER_ATTRIBUTE));
    let module = &assembly.modules[0];
    let update = &module.types[2].methods[0];
    let body = MethodBody::decode(update.body.as_ref().unwrap(), &[]).unwrap();
    let opcodes: Vec<Opcode> = body.instructions().map(|(_, insn)| insn.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            Opcode::Ldstr,
            Opcode::Call,
            Opcode::Ldarg_0,
            Opcode::Brfalse_S,
            Opcode::Leave_S,
            Opcode::Nop,
            Opcode::Leave_S,
            Opcode::Call,
            Opcode::Ret,
        ]
    );
    assert_eq!(module.types[2].methods[1], game().modules[0].types[2].methods[1]);

    // Symbols stay a portable PDB, with offsets following the rewritten code
    let pdb = fs::read(project.scripts.join("Game.pdb")).unwrap();
    assert_eq!(SymbolFormat::detect(&pdb), Some(SymbolFormat::Portable));
    let written = SymbolFile::from_bytes(&pdb).unwrap();
    assert_eq!(written.documents, vec![String::from(PLAYER_SOURCE)]);

    let mut assembly = assembly;
    assert_eq!(written.attach(&mut assembly).unwrap(), 1);
    let offsets: Vec<u32> = assembly.modules[0].types[2].methods[0]
        .sequence_points
        .iter()
        .map(|point| point.il_offset)
        .collect();
    assert_eq!(offsets, vec![10, 15]);
    assert!(!project.scripts.join("Game.dll.mdb").exists());
}

#[test]
fn unsupported_symbols_leave_the_assembly_alone() {
    let project = project();
    let paths = vec![project.scripts.join("Game.dll")];
    let windows_pdb = b"Microsoft C/C++ MSF 7.00\r\n\x1ADS\0\0\0 and the rest".to_vec();
    fs::write(project.scripts.join("Game.pdb"), &windows_pdb).unwrap();
    let before = fs::read(&paths[0]).unwrap();

    let report = batch(&project.managed).run(&paths);
    assert!(matches!(
        report.outcomes[0].1,
        AssemblyOutcome::Failed(Error::UnsupportedSymbols(_))
    ));
    assert_eq!(fs::read(&paths[0]).unwrap(), before);
    assert_eq!(
        fs::read(project.scripts.join("Game.pdb")).unwrap(),
        windows_pdb
    );
}

#[test]
fn second_run_changes_nothing() {
    let project = project();
    let paths = vec![project.scripts.join("Game.dll")];
    let batch = batch(&project.managed);

    let first = batch.run(&paths);
    assert_eq!(first.instrumented_methods(), 1);
    let assembly_after_first = fs::read(&paths[0]).unwrap();
    let symbols_after_first = fs::read(project.scripts.join("Game.pdb")).unwrap();

    let second = batch.run(&paths);
    assert!(matches!(
        second.outcomes[0].1,
        AssemblyOutcome::AlreadyProcessed
    ));
    assert!(!second.has_failures());
    assert_eq!(fs::read(&paths[0]).unwrap(), assembly_after_first);
    assert_eq!(
        fs::read(project.scripts.join("Game.pdb")).unwrap(),
        symbols_after_first
    );
}

#[test]
fn missing_engine_assemblies_do_not_stop_selection() {
    let project = project();
    let paths = vec![project.scripts.join("Game.dll")];

    // Without the `Managed/` search directory, the ancestry stops at `MonoBehaviour`, which is
    // still enough to qualify
    let batch = Batch::new(AssemblyWalker::with_settings(Settings::new()));
    let report = batch.run(&paths);
    assert_eq!(report.instrumented_methods(), 1);
}

#[test]
fn custom_exclusions() {
    let project = project();
    let paths = vec![project.scripts.join("Game.dll")];
    let before = fs::read(&paths[0]).unwrap();

    let mut batch = batch(&project.managed);
    batch.excluded_path_fragments.push(String::from("Game"));
    let report = batch.run(&paths);
    assert!(matches!(report.outcomes[0].1, AssemblyOutcome::Excluded));
    assert_eq!(fs::read(&paths[0]).unwrap(), before);
}
