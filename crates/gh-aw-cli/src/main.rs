use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use gh_aw::codemod;
use gh_aw::config::{AwConfig, CliOverrides};
use gh_aw::diag::Category;
use gh_aw::driver::{self, BatchOutcome};
use gh_aw::engine::{CompileContext, Reporter};
use gh_aw::fetch::{Fetcher, ImportsCache};
use gh_aw::frontmatter;
use gh_aw::types::{CancelFlag, CompileOptions, Layout};

mod progress;

use progress::{SpinnerReporter, StderrReporter};

#[derive(Parser, Debug)]
#[command(name = "gh-aw", version)]
#[command(about = "Compile agentic Markdown workflows into locked GitHub Actions workflows")]
struct Cli {
    /// Repository root containing .github/workflows/
    #[arg(long, default_value = ".", global = true)]
    workdir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile workflow sources into .lock.yml files.
    Compile {
        /// Specific source files (default: every .md under .github/workflows/).
        paths: Vec<PathBuf>,

        /// Re-run affected compilations when sources change.
        #[arg(long)]
        watch: bool,

        /// Enforce strict security policies.
        #[arg(long)]
        strict: bool,

        /// Run the validators only.
        #[arg(long)]
        validate: bool,

        /// Compile fully but skip writing lock files.
        #[arg(long)]
        no_emit: bool,

        /// Remove lock files whose source no longer exists.
        #[arg(long)]
        purge: bool,

        /// Write lock files into this directory instead of next to sources.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Apply codemods in-memory before compiling.
        #[arg(long)]
        fix_first: bool,

        /// Print machine-readable per-file reports on stdout.
        #[arg(long)]
        json_report: bool,

        /// Age after which cached action pins warn (e.g. 90d).
        #[arg(long)]
        stale_pins: Option<String>,
    },

    /// Detect (and optionally apply) rewrites of deprecated frontmatter.
    Fix {
        /// Files to inspect (default: every .md under .github/workflows/).
        paths: Vec<PathBuf>,

        /// Write the rewritten frontmatter back to the files.
        #[arg(long)]
        write: bool,
    },

    /// Print cache, pin-lock, and configuration diagnostics.
    Doctor,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = run(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<i32> {
    let layout = Layout::new(&cli.workdir);
    let config = AwConfig::load(&layout.config_path())?;

    match cli.cmd {
        Commands::Compile {
            paths,
            watch,
            strict,
            validate,
            no_emit,
            purge,
            output_dir,
            fix_first,
            json_report,
            stale_pins,
        } => {
            let overrides = CliOverrides {
                strict: strict.then_some(true),
                output_dir,
                stale_after: stale_pins
                    .as_deref()
                    .map(parse_duration)
                    .transpose()?,
                poll_interval: None,
            };
            let config = config.with_overrides(&overrides);

            let options = CompileOptions {
                paths,
                watch,
                validate,
                no_emit,
                strict: config.compile.strict,
                purge,
                output_dir: config.compile.output_dir.clone(),
                fix_first,
                json_report,
            };
            run_compile(&layout, &config, options)
        }
        Commands::Fix { paths, write } => run_fix(&layout, paths, write),
        Commands::Doctor => {
            run_doctor(&layout, &config)?;
            Ok(0)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(0)
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn run_compile(layout: &Layout, config: &AwConfig, options: CompileOptions) -> Result<i32> {
    let fetcher = Fetcher::new(config.retry.clone())?;
    let cache = ImportsCache::new(layout.imports_cache_dir());
    let ctx = CompileContext {
        layout,
        fetcher: &fetcher,
        cache: &cache,
        options: &options,
        stale_pin_after: config.pins.stale_after,
        cancel: CancelFlag::new(),
        poll_interval: config.watch.poll_interval,
    };

    let interactive = std::io::stderr().is_terminal() && !options.json_report && !options.watch;
    let outcome = if options.watch {
        let mut reporter = StderrReporter;
        reporter.info("watching for changes (ctrl-c to stop)");
        driver::watch(&ctx, &mut reporter)
    } else if interactive {
        let mut reporter = SpinnerReporter::new("compiling workflows");
        let outcome = driver::compile_batch(&ctx, &mut reporter);
        reporter.finish();
        outcome
    } else {
        let mut reporter = StderrReporter;
        driver::compile_batch(&ctx, &mut reporter)
    };

    if options.json_report {
        print_json_report(&outcome)?;
    } else {
        print_summary(&outcome);
    }

    Ok(outcome.exit_code())
}

fn print_summary(outcome: &BatchOutcome) {
    for report in &outcome.reports {
        match &report.lock_path {
            Some(lock) => println!("{} -> {}", report.source_path.display(), lock.display()),
            None => println!("{} (validated)", report.source_path.display()),
        }
    }
    for path in &outcome.shared {
        println!("{} (shared component, skipped)", path.display());
    }
    for (path, error) in &outcome.failures {
        println!("{}: error[{}]: {error}", path.display(), error.category());
    }
}

fn print_json_report(outcome: &BatchOutcome) -> Result<()> {
    #[derive(serde::Serialize)]
    struct JsonFailure<'a> {
        path: &'a std::path::Path,
        category: Category,
        diagnostic: gh_aw::diag::Diagnostic,
    }

    let failures: Vec<JsonFailure<'_>> = outcome
        .failures
        .iter()
        .map(|(path, error)| JsonFailure {
            path,
            category: error.category(),
            diagnostic: error.diagnostic(),
        })
        .collect();

    let report = serde_json::json!({
        "reports": outcome.reports,
        "failures": failures,
        "shared": outcome.shared,
        "purged": outcome.purged,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_fix(layout: &Layout, paths: Vec<PathBuf>, write: bool) -> Result<i32> {
    let paths = if paths.is_empty() {
        let dir = layout.workflows_dir();
        let mut found = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "md") {
                    found.push(path);
                }
            }
        }
        found.sort();
        found
    } else {
        paths
    };

    let mut proposals_found = false;
    for path in &paths {
        let source = match frontmatter::parse_file(path, true) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("[warn] skipping {}: {e}", path.display());
                continue;
            }
        };
        let mut mapping = source.frontmatter.mapping().clone();
        let proposals = if write {
            codemod::apply_all(&mut mapping)
        } else {
            codemod::detect_all(&mapping)
        };
        for proposal in &proposals {
            proposals_found = true;
            println!(
                "{}: {} ({}: {} -> {})",
                path.display(),
                proposal.message(),
                proposal.codemod,
                proposal.before,
                proposal.after
            );
        }
        if write && !proposals.is_empty() {
            let head = serde_yaml::to_string(&mapping)
                .with_context(|| format!("failed to re-serialize {}", path.display()))?;
            let rewritten = format!("---\n{head}---\n{}", source.body);
            std::fs::write(path, rewritten)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{}: rewrote frontmatter", path.display());
        }
    }

    if !write && proposals_found {
        println!("run again with --write to apply");
    }
    Ok(0)
}

fn run_doctor(layout: &Layout, config: &AwConfig) -> Result<()> {
    println!("workdir: {}", layout.workdir.display());
    println!("workflows_dir: {}", layout.workflows_dir().display());
    println!(
        "config: {} ({})",
        layout.config_path().display(),
        if layout.config_path().exists() {
            "present"
        } else {
            "absent, using defaults"
        }
    );
    println!("strict_default: {}", config.compile.strict);

    let cache_dir = layout.imports_cache_dir();
    let cached_files = count_files(&cache_dir);
    println!(
        "imports_cache: {} ({cached_files} cached files)",
        cache_dir.display()
    );

    let pins_path = layout.actions_lock_path();
    let pin_count = std::fs::read_to_string(&pins_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.as_object().map(|o| o.len()))
        .unwrap_or(0);
    println!("actions_lock: {} ({pin_count} pins)", pins_path.display());
    println!(
        "pin_stale_after: {}",
        humantime::format_duration(config.pins.stale_after)
    );
    Ok(())
}

fn count_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn parse_duration_handles_valid_and_invalid_inputs() {
        assert!(parse_duration("90d").is_ok());
        assert!(parse_duration("nope").is_err());
    }

    #[test]
    fn cli_parses_compile_flags() {
        let cli = Cli::parse_from([
            "gh-aw",
            "compile",
            "--strict",
            "--no-emit",
            "--json-report",
            ".github/workflows/ci.md",
        ]);
        match cli.cmd {
            Commands::Compile {
                paths,
                strict,
                no_emit,
                json_report,
                watch,
                ..
            } => {
                assert_eq!(paths.len(), 1);
                assert!(strict);
                assert!(no_emit);
                assert!(json_report);
                assert!(!watch);
            }
            other => panic!("expected compile, got {other:?}"),
        }
    }

    #[test]
    fn fix_dry_run_lists_proposals_without_writing() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        let path = td.path().join("wf.md");
        let original = "---\non: push\ntimeout_minutes: 10\n---\nbody\n";
        fs::write(&path, original).expect("write");

        let code = run_fix(&layout, vec![path.clone()], false).expect("fix");
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(&path).expect("read"), original);
    }

    #[test]
    fn fix_write_rewrites_frontmatter_and_keeps_body() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        let path = td.path().join("wf.md");
        fs::write(&path, "---\non: push\ntimeout_minutes: 10\n---\nThe body.\n").expect("write");

        run_fix(&layout, vec![path.clone()], true).expect("fix");
        let rewritten = fs::read_to_string(&path).expect("read");
        assert!(rewritten.contains("timeout-minutes: 10"), "{rewritten}");
        assert!(!rewritten.contains("timeout_minutes"), "{rewritten}");
        assert!(rewritten.ends_with("The body.\n"), "{rewritten}");
    }

    #[test]
    fn doctor_runs_on_empty_workdir() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        run_doctor(&layout, &AwConfig::default()).expect("doctor");
    }
}
