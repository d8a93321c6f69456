//! Batch and watch drivers over the workflows directory.
//!
//! Compilation is parallel, stateless, and per-workflow: each file runs on
//! its own thread with no shared mutable in-memory state (the imports
//! cache and the pin lock synchronize on disk). A failure in one file
//! never prevents compilation of another.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::diag::CompileError;
use crate::engine::{CompileContext, FileOutcome, Reporter, compile_file};
use crate::types::FileReport;

/// The result of one batch run.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub reports: Vec<FileReport>,
    pub failures: Vec<(PathBuf, CompileError)>,
    pub shared: Vec<PathBuf>,
    pub purged: Vec<PathBuf>,
}

impl BatchOutcome {
    /// The exit code for the whole batch: the worst failure wins, in the
    /// order internal > io > validation.
    pub fn exit_code(&self) -> i32 {
        self.failures
            .iter()
            .map(|(_, e)| e.category().exit_code())
            .max()
            .unwrap_or(0)
    }
}

/// Buffers reporter output so parallel compilations do not interleave.
#[derive(Default)]
struct BufferReporter {
    lines: Vec<(u8, String)>,
}

impl Reporter for BufferReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push((0, msg.to_string()));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push((1, msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push((2, msg.to_string()));
    }
}

fn replay(buffer: BufferReporter, reporter: &mut dyn Reporter) {
    for (level, msg) in buffer.lines {
        match level {
            0 => reporter.info(&msg),
            1 => reporter.warn(&msg),
            _ => reporter.error(&msg),
        }
    }
}

/// Enumerate compilable sources: explicit paths, or every `.md` under the
/// workflows directory, sorted for determinism.
pub fn enumerate_sources(ctx: &CompileContext<'_>) -> Result<Vec<PathBuf>, CompileError> {
    if !ctx.options.paths.is_empty() {
        return Ok(ctx.options.paths.clone());
    }
    let dir = ctx.layout.workflows_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(&dir)
        .map_err(|e| CompileError::io(&dir, format!("failed to read {}", dir.display()), e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Compile every enumerated source, in parallel, one thread per file.
pub fn compile_batch(ctx: &CompileContext<'_>, reporter: &mut dyn Reporter) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    if ctx.options.purge {
        outcome.purged = purge_orphans(ctx, reporter);
    }

    let paths = match enumerate_sources(ctx) {
        Ok(paths) => paths,
        Err(e) => {
            reporter.error(&e.to_string());
            outcome.failures.push((PathBuf::new(), e));
            return outcome;
        }
    };

    let results: Vec<(PathBuf, BufferReporter, Result<FileOutcome, CompileError>)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = paths
                .iter()
                .map(|path| {
                    scope.spawn(move || {
                        let mut buffer = BufferReporter::default();
                        let result = compile_file(ctx, path, &mut buffer);
                        (path.clone(), buffer, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("compile thread panicked"))
                .collect()
        });

    for (path, buffer, result) in results {
        replay(buffer, reporter);
        match result {
            Ok(FileOutcome::Compiled(report)) => {
                reporter.info(&format!(
                    "compiled {} ({} imports)",
                    path.display(),
                    report.import_manifest.len()
                ));
                outcome.reports.push(report);
            }
            Ok(FileOutcome::SharedComponent) => {
                outcome.shared.push(path);
            }
            Err(e) => {
                reporter.error(&e.to_string());
                outcome.failures.push((path, e));
            }
        }
    }

    outcome
}

/// Remove lock files whose source `.md` no longer exists.
fn purge_orphans(ctx: &CompileContext<'_>, reporter: &mut dyn Reporter) -> Vec<PathBuf> {
    let dir = ctx.layout.workflows_dir();
    let mut purged = Vec::new();
    let Ok(entries) = fs::read_dir(&dir) else {
        return purged;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".lock.yml") else {
            continue;
        };
        let source = dir.join(format!("{stem}.md"));
        if !source.exists() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    reporter.info(&format!("purged orphan {}", path.display()));
                    purged.push(path);
                }
                Err(e) => reporter.warn(&format!("failed to purge {}: {e}", path.display())),
            }
        }
    }
    purged.sort();
    purged
}

/// Local files whose change invalidates a workflow: the source itself plus
/// every local manifest entry.
fn dependency_closure(ctx: &CompileContext<'_>, report: &FileReport) -> Vec<PathBuf> {
    let mut paths = vec![report.source_path.clone()];
    for entry in &report.import_manifest {
        let Some((path_part, _sha)) = entry.rsplit_once('@') else {
            continue;
        };
        // Remote entries are `owner/repo/path`; locals are workdir-relative
        // and exist on disk.
        let candidate = ctx.layout.workdir.join(path_part);
        if candidate.exists() {
            paths.push(candidate);
        }
    }
    paths
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watch mode: poll for changes, recompiling every workflow whose
/// dependency closure contains a changed file. Concurrent edits within one
/// poll interval coalesce into a single recompilation.
pub fn watch(ctx: &CompileContext<'_>, reporter: &mut dyn Reporter) -> BatchOutcome {
    let mut last = compile_batch(ctx, reporter);
    let mut stamps: BTreeMap<PathBuf, SystemTime> = BTreeMap::new();
    let mut closures: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    let refresh =
        |outcome: &BatchOutcome,
         stamps: &mut BTreeMap<PathBuf, SystemTime>,
         closures: &mut BTreeMap<PathBuf, Vec<PathBuf>>| {
            for report in &outcome.reports {
                let closure = dependency_closure(ctx, report);
                for path in &closure {
                    if let Some(stamp) = mtime(path) {
                        stamps.insert(path.clone(), stamp);
                    }
                }
                closures.insert(report.source_path.clone(), closure);
            }
        };
    refresh(&last, &mut stamps, &mut closures);

    while !ctx.cancel.is_cancelled() {
        std::thread::sleep(ctx.poll_interval);
        if ctx.cancel.is_cancelled() {
            break;
        }

        let mut dirty: Vec<PathBuf> = Vec::new();
        for (source, closure) in &closures {
            let changed = closure.iter().any(|path| match mtime(path) {
                Some(stamp) => stamps.get(path) != Some(&stamp),
                None => true,
            });
            if changed {
                dirty.push(source.clone());
            }
        }
        // New files appear; removed files purge their closure entry.
        let current = enumerate_sources(ctx).unwrap_or_default();
        for path in &current {
            if !closures.contains_key(path) && mtime(path).is_some() {
                dirty.push(path.clone());
            }
        }

        if dirty.is_empty() {
            continue;
        }
        dirty.sort();
        dirty.dedup();
        reporter.info(&format!("{} workflow(s) changed; recompiling", dirty.len()));

        for source in dirty {
            let mut buffer = BufferReporter::default();
            match compile_file(ctx, &source, &mut buffer) {
                Ok(FileOutcome::Compiled(report)) => {
                    replay(buffer, reporter);
                    let closure = dependency_closure(ctx, &report);
                    for path in &closure {
                        if let Some(stamp) = mtime(path) {
                            stamps.insert(path.clone(), stamp);
                        }
                    }
                    closures.insert(report.source_path.clone(), closure);
                    if let Some(existing) =
                        last.reports.iter_mut().find(|r| r.source_path == source)
                    {
                        *existing = report;
                    } else {
                        last.reports.push(report);
                    }
                }
                Ok(FileOutcome::SharedComponent) => {
                    replay(buffer, reporter);
                    closures.remove(&source);
                }
                Err(e) => {
                    replay(buffer, reporter);
                    reporter.error(&e.to_string());
                    // Keep watching; record the stamp and a self-only
                    // closure so the failure does not re-trigger every tick.
                    if let Some(stamp) = mtime(&source) {
                        stamps.insert(source.clone(), stamp);
                    }
                    closures.insert(source.clone(), vec![source.clone()]);
                }
            }
        }
    }

    last
}
