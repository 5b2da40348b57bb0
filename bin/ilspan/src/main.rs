use ilspan::batch::{AssemblyOutcome, Batch};
use ilspan::inject::{AssemblyWalker, CalleeRef, FrameHookSelector, Settings};

use clap::{value_parser, Arg, ArgAction, Command};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use walkdir::WalkDir;

fn main() -> Result<(), ilspan::Error> {
    env_logger::init();

    let matches = Command::new("CIL profiler span injector")
        .version("0.1.0")
        .author("Alec Theriault <alec.theriault@gmail.com>")
        .about("Wrap the per-frame callbacks of compiled assemblies in profiler spans")
        .arg(
            Arg::new("search-dir")
                .long("search-dir")
                .value_name("DIR")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .help("Directory to search for referenced assemblies (repeatable)"),
        )
        .arg(
            Arg::new("dir")
                .long("dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Process every `*.dll` in this directory"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .value_name("PREFIX")
                .default_value(Settings::DEFAULT_LABEL_PREFIX)
                .help("Prefix of the span labels"),
        )
        .arg(
            Arg::new("begin")
                .long("begin")
                .value_name("[ASSEMBLY]TYPE::METHOD")
                .default_value(Settings::DEFAULT_BEGIN)
                .help("Static `void (string)` method that opens a span"),
        )
        .arg(
            Arg::new("end")
                .long("end")
                .value_name("[ASSEMBLY]TYPE::METHOD")
                .default_value(Settings::DEFAULT_END)
                .help("Static `void ()` method that closes a span"),
        )
        .arg(
            Arg::new("base-type")
                .long("base-type")
                .value_name("FRAGMENT")
                .default_value(FrameHookSelector::DEFAULT_BASE_FRAGMENT)
                .help("Only types with an ancestor whose full name contains this are instrumented"),
        )
        .arg(
            Arg::new("exclude")
                .long("exclude")
                .value_name("FRAGMENT")
                .action(ArgAction::Append)
                .help("Skip assemblies whose path contains this (repeatable, adds to the defaults)"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Assemblies to instrument")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Append)
                .required_unless_present("dir"),
        )
        .get_matches();

    let mut settings = Settings::new();
    if let Some(prefix) = matches.get_one::<String>("prefix") {
        settings.label_prefix = prefix.clone();
    }
    if let Some(begin) = matches.get_one::<String>("begin") {
        settings.begin = CalleeRef::parse(begin)?;
    }
    if let Some(end) = matches.get_one::<String>("end") {
        settings.end = CalleeRef::parse(end)?;
    }
    let mut selector = FrameHookSelector::new();
    if let Some(base_type) = matches.get_one::<String>("base-type") {
        selector.base_fragment = base_type.clone();
    }

    let mut batch = Batch::new(AssemblyWalker::new(settings, selector));
    if let Some(directories) = matches.get_many::<PathBuf>("search-dir") {
        batch.search_directories.extend(directories.cloned());
    }
    if let Some(fragments) = matches.get_many::<String>("exclude") {
        batch.excluded_path_fragments.extend(fragments.cloned());
    }

    // Explicit inputs first, then whatever is in `--dir`
    let mut inputs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("INPUT")
        .map(|paths| paths.cloned().collect())
        .unwrap_or_default();
    if let Some(directory) = matches.get_one::<PathBuf>("dir") {
        batch.search_directories.push(directory.clone());
        let mut found: Vec<PathBuf> = WalkDir::new(directory)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|e| e.is_file() && e.extension().map_or(false, |ex| ex == "dll"))
            .collect();
        found.sort();
        log::info!("Found {} assemblies in {}", found.len(), directory.display());
        inputs.extend(found);
    }

    let report = batch.run(&inputs);

    // Print out the outcomes
    let stdout = StandardStream::stdout(ColorChoice::Auto);
    let mut s = stdout.lock();
    for (path, outcome) in &report.outcomes {
        let (color, summary, detail) = match outcome {
            AssemblyOutcome::Instrumented { methods } => (
                Color::Green,
                "INSTRUMENTED",
                Some(format!("{} method(s)", methods.len())),
            ),
            AssemblyOutcome::AlreadyProcessed => (Color::Cyan, "ALREADY PROCESSED", None),
            AssemblyOutcome::Excluded => (Color::Yellow, "SKIPPED", None),
            AssemblyOutcome::Failed(err) => (Color::Red, "FAILED", Some(err.to_string())),
        };
        write_outcome(&mut s, &path.to_string_lossy(), color, summary, detail.as_deref())?;
    }
    drop(s);

    log::info!(
        "Injected {} span(s) across {} assemblies",
        report.instrumented_methods(),
        report.outcomes.len()
    );

    // Exit code
    exit(if report.has_failures() { 1 } else { 0 })
}

fn write_outcome<W: WriteColor>(
    s: &mut W,
    path: &str,
    color: Color,
    summary: &str,
    detail: Option<&str>,
) -> io::Result<()> {
    s.write_all(b" - ")?;
    s.set_color(ColorSpec::new().set_bold(true))?;
    s.write_all(path.as_bytes())?;
    s.set_color(ColorSpec::new().set_dimmed(true))?;
    s.write_all(b" [")?;
    s.set_color(ColorSpec::new().set_fg(Some(color)))?;
    s.write_all(summary.as_bytes())?;
    s.set_color(ColorSpec::new().set_dimmed(true))?;
    s.write_all(b"]")?;
    if let Some(detail) = detail {
        write!(s, " {}", detail)?;
    }
    s.write_all(b"\n")?;
    s.reset()
}
