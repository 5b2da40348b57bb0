//! Instrumenting a set of assemblies on disk
//!
//! Each assembly is processed on its own: it is loaded (along with its debug symbols, if there
//! are any), walked, and written back over the original files only if the walk changed it. The
//! symbols and the assembly are replaced together or not at all. A failure in one assembly is
//! reported and the batch moves on to the next.

use crate::inject::{AssemblyWalker, FrameHookSelector, HookSelector, WalkOutcome};
use crate::metadata::Assembly;
use crate::resolve::{AssemblyResolver, ResolverArenas};
use crate::symbols::{self, SymbolFile};
use crate::Error;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// What happened to one assembly of a batch
#[derive(Debug)]
pub enum AssemblyOutcome {
    /// Marked and rewritten on disk, with spans injected into the listed methods
    Instrumented { methods: Vec<String> },

    /// Already carried the processed marker, so the file was not touched
    AlreadyProcessed,

    /// Path matched one of the excluded fragments
    Excluded,

    /// Something went wrong, and the file was not touched
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(PathBuf, AssemblyOutcome)>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Total number of methods that got a span
    pub fn instrumented_methods(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                AssemblyOutcome::Instrumented { methods } => methods.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &Error)> + '_ {
        self.outcomes.iter().filter_map(|(path, outcome)| match outcome {
            AssemblyOutcome::Failed(err) => Some((path.as_path(), err)),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

pub struct Batch<S = FrameHookSelector> {
    pub walker: AssemblyWalker<S>,

    /// Directories searched for referenced assemblies (the directory of every input assembly is
    /// searched too)
    pub search_directories: Vec<PathBuf>,

    /// Assemblies whose path contains any of these are skipped
    pub excluded_path_fragments: Vec<String>,
}

/// Path fragments of assemblies that are never instrumented (the rewriting library itself and
/// editor-only assemblies)
pub const DEFAULT_EXCLUDED_PATH_FRAGMENTS: [&str; 2] = ["Cecil", "Editor"];

impl<S: HookSelector> Batch<S> {
    pub fn new(walker: AssemblyWalker<S>) -> Self {
        Batch {
            walker,
            search_directories: vec![],
            excluded_path_fragments: DEFAULT_EXCLUDED_PATH_FRAGMENTS
                .iter()
                .map(|fragment| String::from(*fragment))
                .collect(),
        }
    }

    pub fn is_excluded_path(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.excluded_path_fragments
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
    }

    /// Process every assembly (duplicates are only processed once)
    pub fn run(&self, paths: &[PathBuf]) -> BatchReport {
        let arenas = ResolverArenas::new();
        let mut resolver = AssemblyResolver::new(&arenas);
        for directory in &self.search_directories {
            resolver.add_search_directory(directory);
        }
        for path in paths {
            if let Some(directory) = path.parent() {
                resolver.add_search_directory(directory);
            }
        }

        let mut report = BatchReport::default();
        let mut seen: HashSet<&Path> = HashSet::new();
        for path in paths {
            if !seen.insert(path.as_path()) {
                continue;
            }

            let outcome = if self.is_excluded_path(path) {
                log::warn!("Skipping {}", path.display());
                AssemblyOutcome::Excluded
            } else {
                log::info!("Processing {}", path.display());
                self.process(path, &resolver).unwrap_or_else(|err| {
                    log::error!("Failed to process {}: {}", path.display(), err);
                    AssemblyOutcome::Failed(err)
                })
            };
            report.outcomes.push((path.clone(), outcome));
        }
        report
    }

    fn process<'r>(
        &self,
        path: &Path,
        resolver: &'r AssemblyResolver<'r>,
    ) -> Result<AssemblyOutcome, Error> {
        let mut assembly = Assembly::read_from_path(path)?;

        let symbols = match symbols::locate(path) {
            Some(symbols_path) => {
                let symbols = SymbolFile::read_from_path(&symbols_path)?;
                let methods = symbols.attach(&mut assembly)?;
                log::debug!(
                    "Loaded symbols of {} methods from {}",
                    methods,
                    symbols_path.display()
                );
                Some((symbols_path, symbols))
            }
            None => None,
        };

        let methods = match self.walker.walk(&mut assembly, resolver)? {
            WalkOutcome::AlreadyProcessed => return Ok(AssemblyOutcome::AlreadyProcessed),
            WalkOutcome::Processed { labels } => labels,
        };

        // Serialize everything before touching any file
        let (assembly_bytes, row_counts) = assembly.encode()?;
        let mut files = vec![];
        if let Some((symbols_path, symbols)) = symbols {
            files.push((symbols_path, symbols.rewrite(&assembly, row_counts)?));
        }
        files.push((path.to_path_buf(), assembly_bytes));
        replace_files(&files)?;

        Ok(AssemblyOutcome::Instrumented { methods })
    }
}

/// Replace the contents of several files, all or nothing
///
/// Every file is first written out in full to a temporary file next to its target. Only then are
/// the temporary files renamed over their targets, in order. If a rename fails, the targets that
/// were already replaced get their old contents back.
fn replace_files(files: &[(PathBuf, Vec<u8>)]) -> Result<(), Error> {
    let mut staged = Vec::with_capacity(files.len());
    for (path, contents) in files {
        let directory = path
            .parent()
            .filter(|directory| !directory.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(directory)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        if let Ok(metadata) = fs::metadata(path) {
            fs::set_permissions(file.path(), writable(metadata.permissions()))?;
            make_writable(path)?;
        }
        staged.push((path.as_path(), file));
    }

    let mut replaced: Vec<(&Path, Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
    for (path, file) in staged {
        let previous = fs::read(path).ok();
        if let Err(err) = file.persist(path) {
            restore(&replaced);
            return Err(err.error.into());
        }
        log::debug!("Wrote {}", path.display());
        replaced.push((path, previous));
    }
    Ok(())
}

/// Put back the previous contents of replaced files
fn restore(replaced: &[(&Path, Option<Vec<u8>>)]) {
    for (path, previous) in replaced.iter().rev() {
        let restored = match previous {
            Some(contents) => fs::write(path, contents),
            None => fs::remove_file(path),
        };
        match restored {
            Ok(()) => log::warn!("Restored {}", path.display()),
            Err(err) => log::error!("Failed to restore {}: {}", path.display(), err),
        }
    }
}

fn writable(mut permissions: fs::Permissions) -> fs::Permissions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    permissions.set_readonly(false);

    permissions
}

/// Clear the read-only attribute of a file
fn make_writable(path: &Path) -> io::Result<()> {
    let permissions = fs::metadata(path)?.permissions();
    if !permissions.readonly() {
        return Ok(());
    }
    fs::set_permissions(path, writable(permissions))
}

/// Makes sure a batch only runs once until it is explicitly reset
///
/// Hosts that trigger instrumentation from several lifecycle events (eg. once per processed scene)
/// would otherwise instrument the same files over and over.
#[derive(Debug, Default)]
pub struct RunGuard {
    has_run: bool,
}

impl RunGuard {
    pub fn new() -> RunGuard {
        RunGuard { has_run: false }
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Allow the next `run` through (eg. after a new build)
    pub fn reset(&mut self) {
        self.has_run = false;
    }

    pub fn run<S: HookSelector>(&mut self, batch: &Batch<S>, paths: &[PathBuf]) -> BatchReport {
        if self.has_run {
            log::info!("Batch already ran, skipping");
            return BatchReport::default();
        }
        self.has_run = true;
        batch.run(paths)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inject::Settings;

    fn batch() -> Batch {
        Batch::new(AssemblyWalker::with_settings(Settings::new()))
    }

    #[test]
    fn default_path_exclusions() {
        let batch = batch();
        assert!(batch.is_excluded_path(Path::new("Library/ScriptAssemblies/Mono.Cecil.dll")));
        assert!(batch.is_excluded_path(Path::new("Library/ScriptAssemblies/Assembly-CSharp-Editor.dll")));
        assert!(!batch.is_excluded_path(Path::new("Library/ScriptAssemblies/Assembly-CSharp.dll")));
    }

    #[test]
    fn run_guard_only_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let missing = vec![dir.path().join("Missing.dll")];
        let batch = batch();

        let mut guard = RunGuard::new();
        let report = guard.run(&batch, &missing);
        assert!(report.has_failures());
        assert!(guard.has_run());

        assert!(guard.run(&batch, &missing).is_empty());

        guard.reset();
        assert_eq!(guard.run(&batch, &missing).outcomes.len(), 1);
    }

    #[test]
    fn duplicate_paths_are_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Missing.dll");
        let report = batch().run(&[path.clone(), path]);
        assert_eq!(report.outcomes.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn read_only_files_become_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.dll");
        fs::write(&path, b"").unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions).unwrap();

        make_writable(&path).unwrap();
        assert!(!fs::metadata(&path).unwrap().permissions().readonly());
    }

    #[test]
    fn files_are_replaced_together() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = dir.path().join("Game.pdb");
        let dll = dir.path().join("Game.dll");
        fs::write(&pdb, b"old symbols").unwrap();

        replace_files(&[(pdb.clone(), b"symbols".to_vec()), (dll.clone(), b"code".to_vec())])
            .unwrap();
        assert_eq!(fs::read(&pdb).unwrap(), b"symbols");
        assert_eq!(fs::read(&dll).unwrap(), b"code");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn unwritable_symbols_leave_the_assembly_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = dir.path().join("Game.pdb");
        fs::create_dir(&pdb).unwrap();
        let dll = dir.path().join("Game.dll");
        fs::write(&dll, b"original").unwrap();

        let files = [(pdb.clone(), b"symbols".to_vec()), (dll.clone(), b"code".to_vec())];
        assert!(matches!(replace_files(&files), Err(Error::IoError(_))));
        assert_eq!(fs::read(&dll).unwrap(), b"original");
        assert!(pdb.is_dir());
        // staged files are cleaned up
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn failed_replacements_are_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = dir.path().join("Game.pdb");
        fs::write(&pdb, b"old symbols").unwrap();
        let fresh = dir.path().join("Fresh.pdb");
        let dll = dir.path().join("Game.dll");
        fs::create_dir(&dll).unwrap();

        let files = [
            (pdb.clone(), b"symbols".to_vec()),
            (fresh.clone(), b"more symbols".to_vec()),
            (dll.clone(), b"code".to_vec()),
        ];
        assert!(replace_files(&files).is_err());
        assert_eq!(fs::read(&pdb).unwrap(), b"old symbols");
        assert!(!fresh.exists());
    }
}
