use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
    time::SystemTime,
};

use jane_eyre::eyre::{self, Context, OptionExt};
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, info, warn};

use crate::{
    hierarchy::compute_parents_and_self_time,
    json::{decode, DecodeError, TraceProfile},
    report::synthesize,
    threads::{compute_duration, compute_thread_info, thread_summary, ThreadInfo},
    timings::{
        extract_build_stats, extract_build_timings, merge_build_timings_into, BuildStats,
        BuildTimings,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// clang `-ftime-trace` output.
    Build,
    Memory,
    Perf,
    Unknown,
}

/// How the bytes were stored. Unpacking is the caller's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    /// A zip of one or more traces.
    Archive,
    /// A single gzipped trace.
    Compressed,
    File,
}

/// Everything we derive from one trace file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileAnalysis {
    pub kind: FileKind,
    /// Seconds.
    pub duration: f64,
    /// Only for memory traces.
    pub threads: BTreeMap<i64, ThreadInfo>,
    pub thread_summary: String,
    /// Only for build traces.
    pub build: Option<BuildAnalysis>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BuildAnalysis {
    pub timings: BuildTimings,
    pub stats: BuildStats,
}

/// Decides whether a cached [FileAnalysis] is still good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

/// Analyses keyed by path, reanalysing only when the file changes.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: BTreeMap<PathBuf, (Fingerprint, FileAnalysis)>,
}

impl ContainerKind {
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(OsStr::to_str) {
            Some("zip") => Self::Archive,
            Some("gz") => Self::Compressed,
            _ => Self::File,
        }
    }
}

impl FileKind {
    pub fn of(path: &Path) -> Self {
        if ContainerKind::of(path) != ContainerKind::File {
            // Classify `foo.json.gz` as `foo.json`.
            return Self::of(&path.with_extension(""));
        }
        match path.extension().and_then(OsStr::to_str) {
            Some("json") if is_build_tool_json(path) => Self::Unknown,
            Some("json" | "buildtrace") => Self::Build,
            Some("memtrace") => Self::Memory,
            Some("trace" | "perftrace") => Self::Perf,
            _ => Self::Unknown,
        }
    }

    pub fn is_supported(path: &Path) -> bool {
        Self::of(path) != Self::Unknown
    }
}

/// JSON files that build tools leave next to the traces.
fn is_build_tool_json(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(OsStr::to_str) else {
        return false;
    };

    matches!(
        name,
        "build-description.json" | "build-request.json" | "manifest.json"
    ) || [
        "diagnostic-filename-map.json",
        ".abi.json",
        "-OutputFileMap.json",
        "_const_extract_protocols.json",
    ]
    .iter()
    .any(|suffix| name.ends_with(suffix))
}

/// Analyses one already-decompressed trace. Same bytes in, same analysis out.
pub fn analyse_bytes(kind: FileKind, bytes: &[u8]) -> Result<FileAnalysis, DecodeError> {
    let TraceProfile {
        traceEvents: mut events,
        ..
    } = decode(bytes)?;
    debug!(?kind, events = events.len(), "Decoded trace");

    let duration = compute_duration(&events);
    let mut result = FileAnalysis {
        kind,
        duration,
        threads: BTreeMap::default(),
        thread_summary: String::default(),
        build: None,
    };
    match kind {
        FileKind::Memory => {
            result.threads = compute_thread_info(&events);
            result.thread_summary = thread_summary(&result.threads);
        }
        FileKind::Build => {
            compute_parents_and_self_time(&mut events);
            result.build = Some(BuildAnalysis {
                timings: extract_build_timings(&events),
                stats: extract_build_stats(&events),
            });
        }
        FileKind::Perf | FileKind::Unknown => {}
    }

    Ok(result)
}

#[tracing::instrument(level = "error")]
pub fn analyse_file(path: &Path) -> eyre::Result<FileAnalysis> {
    info!("Analysing file");
    let bytes = std::fs::read(path).wrap_err("Failed to read file")?;

    Ok(analyse_bytes(FileKind::of(path), &bytes)?)
}

/// Analyses every file in parallel. One file failing doesn't stop the others.
pub fn analyse_files(paths: &[PathBuf]) -> Vec<(PathBuf, eyre::Result<FileAnalysis>)> {
    let result = paths
        .par_iter()
        .map(|path| (path.clone(), analyse_file(path)))
        .collect::<Vec<_>>();
    for (path, outcome) in &result {
        if let Err(error) = outcome {
            warn!(?path, "Failed to analyse file: {error:#}");
        }
    }

    result
}

/// Merges the build analyses into one report.
///
/// Timings are summed. Stats are summed then averaged over the contributing files, so the
/// Build Totals track looks like one typical compile.
pub fn build_report<'a>(analyses: impl IntoIterator<Item = &'a FileAnalysis>) -> TraceProfile {
    let builds = analyses
        .into_iter()
        .filter_map(|a| a.build.as_ref())
        .collect::<Vec<_>>();
    let count = builds.len();

    let timings = builds
        .par_iter()
        .map(|b| b.timings.clone())
        .reduce(BuildTimings::default, merge_build_timings_into);
    let mut stats = builds
        .into_par_iter()
        .map(|b| b.stats.clone())
        .reduce(BuildStats::default, |mut lhs, rhs| {
            lhs.combine(&rhs);
            lhs
        });
    debug!(count, timings = timings.len(), "Merged build timings");
    stats.divide_by(count);

    synthesize(&timings, &stats)
}

/// `"1.234s"`, or `"1.234m"` for memory traces. Empty for zero.
pub fn format_duration(kind: FileKind, seconds: f64) -> String {
    if seconds == 0.0 {
        return String::default();
    }
    let unit = if kind == FileKind::Memory { "m" } else { "s" };

    format!("{seconds:.3}{unit}")
}

/// `"/ 12.000s 25% "`, with the percentage only when it's at least 1%.
pub fn format_total_duration(seconds: f64, total_seconds: f64) -> String {
    if total_seconds == 0.0 {
        return String::default();
    }
    let mut result = format!("/ {total_seconds:.3}s ");
    let percent = seconds * 100.0 / total_seconds;
    if percent >= 1.0 {
        result += &format!("{percent:.0}% ");
    }

    result
}

/// The last two directories above a file, like `dir0/dir1`.
pub fn short_directory(path: &Path) -> String {
    let dirs = path
        .parent()
        .into_iter()
        .flat_map(|p| p.components())
        .filter_map(|c| c.as_os_str().to_str())
        .filter(|c| *c != "/")
        .collect::<Vec<_>>();

    dirs[dirs.len().saturating_sub(2)..].join("/")
}

impl Fingerprint {
    pub fn of(path: &Path) -> eyre::Result<Self> {
        let metadata = std::fs::metadata(path).wrap_err("Failed to get metadata")?;

        Ok(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

impl AnalysisCache {
    pub fn is_reload_needed(&self, path: &Path) -> eyre::Result<bool> {
        let Some((fingerprint, _)) = self.entries.get(path) else {
            return Ok(true);
        };

        Ok(*fingerprint != Fingerprint::of(path)?)
    }

    pub fn get_or_analyse(&mut self, path: &Path) -> eyre::Result<&FileAnalysis> {
        let fingerprint = Fingerprint::of(path)?;
        let fresh = matches!(self.entries.get(path), Some((cached, _)) if *cached == fingerprint);
        if !fresh {
            let analysis = analyse_file(path)?;
            self.entries
                .insert(path.to_owned(), (fingerprint, analysis));
        }

        self.entries
            .get(path)
            .map(|(_, analysis)| analysis)
            .ok_or_eyre("Cache entry vanished")
    }

    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[test]
fn test_file_kind() {
    assert_eq!(FileKind::of(Path::new("a/b.json")), FileKind::Build);
    assert_eq!(FileKind::of(Path::new("b.buildtrace.gz")), FileKind::Build);
    assert_eq!(FileKind::of(Path::new("b.memtrace")), FileKind::Memory);
    assert_eq!(FileKind::of(Path::new("b.perftrace.zip")), FileKind::Perf);
    assert_eq!(FileKind::of(Path::new("b.trace")), FileKind::Perf);
    assert_eq!(FileKind::of(Path::new("b.txt.gz")), FileKind::Unknown);
    assert_eq!(ContainerKind::of(Path::new("b.zip")), ContainerKind::Archive);
    assert!(!FileKind::is_supported(Path::new("README")));

    for name in [
        "out/build-description.json",
        "build-request.json",
        "manifest.json.gz",
        "Foo-diagnostic-filename-map.json",
        "x86_64/Foo.abi.json",
        "Foo-OutputFileMap.json",
        "Foo_const_extract_protocols.json",
    ] {
        assert_eq!(FileKind::of(Path::new(name)), FileKind::Unknown, "{name}");
    }
    assert_eq!(FileKind::of(Path::new("my-manifest.json")), FileKind::Build);
    assert_eq!(FileKind::of(Path::new("manifest.buildtrace")), FileKind::Build);
}

#[test]
fn test_formatting() {
    assert_eq!(format_duration(FileKind::Build, 0.0), "");
    assert_eq!(format_duration(FileKind::Build, 1.23456), "1.235s");
    assert_eq!(format_duration(FileKind::Memory, 2.0), "2.000m");
    assert_eq!(format_total_duration(3.0, 0.0), "");
    assert_eq!(format_total_duration(3.0, 12.0), "/ 12.000s 25% ");
    assert_eq!(format_total_duration(0.01, 12.0), "/ 12.000s ");
    assert_eq!(short_directory(Path::new("/x/dir0/dir1/file.json")), "dir0/dir1");
    assert_eq!(short_directory(Path::new("dir1/file.json")), "dir1");
    assert_eq!(short_directory(Path::new("file.json")), "");
}

#[cfg(test)]
static BUILD_TRACE: &str = r#"{"traceEvents": [
    {"pid": 1, "tid": 0, "ph": "M", "name": "thread_name", "args": {"name": "clang"}},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 0, "dur": 1000, "name": "ExecuteCompiler"},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 10, "dur": 600, "name": "Frontend"},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 20, "dur": 300, "name": "Source", "args": {"detail": "/inc/a.h"}},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 50, "dur": 100, "name": "Source", "args": {"detail": "/inc/b.h"}},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 650, "dur": 300, "name": "Backend"},
    {"pid": 1, "tid": 0, "ph": "X", "ts": 660, "dur": 200, "name": "OptModule", "args": {"detail": "/src/main.cpp"}},
    {"pid": 1, "tid": 1, "ph": "X", "ts": 0, "dur": 1000, "name": "Total ExecuteCompiler"},
    {"pid": 1, "tid": 2, "ph": "X", "ts": 0, "dur": 600, "name": "Total Frontend"},
    {"pid": 1, "tid": 3, "ph": "X", "ts": 0, "dur": 400, "name": "Total Source"}
]}"#;

#[test]
fn test_analyse_build_bytes() -> eyre::Result<()> {
    let analysis = analyse_bytes(FileKind::Build, BUILD_TRACE.as_bytes())?;
    assert!((analysis.duration - 0.001).abs() < 1e-12);
    assert!(analysis.threads.is_empty());

    let build = analysis.build.as_ref().ok_or_eyre("No build analysis")?;
    assert_eq!(build.timings.len(), 3);
    let a = &build.timings[&(crate::timings::TimingKind::Parse, "/inc/a.h".to_owned())];
    assert_eq!((a.duration, a.self_duration()), (300, 200));
    assert_eq!(build.stats.total_execute_compiler, 1000);
    assert_eq!(build.stats.total_source, 400);
    assert_eq!(build.stats.frontend_start, Some(10));
    assert_eq!(build.stats.backend_start, Some(650));

    // Deterministic.
    assert_eq!(analyse_bytes(FileKind::Build, BUILD_TRACE.as_bytes())?, analysis);

    Ok(())
}

#[test]
fn test_analyse_memory_bytes() -> eyre::Result<()> {
    let analysis = analyse_bytes(
        FileKind::Memory,
        br#"{"traceEvents": [
            {"tid": 1, "ph": "M", "name": "thread_name", "args": {"name": "heap"}},
            {"tid": 1, "ph": "X", "ts": 0, "dur": 10, "name": "Alloc"},
            {"tid": 1, "ph": "X", "ts": 20, "dur": 5, "name": "Free"}
        ]}"#,
    )?;
    assert_eq!(analysis.build, None);
    assert_eq!(analysis.thread_summary, "1 heap: 0.000s 40% 2x\n");

    Ok(())
}

#[test]
fn test_build_report_averages_stats() -> eyre::Result<()> {
    let analysis = analyse_bytes(FileKind::Build, BUILD_TRACE.as_bytes())?;
    let memory = analyse_bytes(FileKind::Memory, br#"{"traceEvents": []}"#)?;
    let report = build_report([&analysis, &analysis, &memory]);

    let names = report
        .traceEvents
        .iter()
        .filter_map(|e| e.name.as_deref())
        .collect::<Vec<_>>();
    assert!(names.contains(&"a.h 2x 0.001s"));
    assert!(names.contains(&"main.cpp 2x 0.000s"));
    let execute_compiler = report
        .traceEvents
        .iter()
        .find(|e| e.has_name("Total ExecuteCompiler"))
        .and_then(|e| e.dur);
    // Two files, averaged.
    assert_eq!(execute_compiler, Some(1000));

    Ok(())
}

#[test]
fn test_cache_reanalyses_changed_files() -> eyre::Result<()> {
    let temp = mktemp::Temp::new_file()?;
    let path = temp.with_extension("json");
    std::fs::write(&path, BUILD_TRACE)?;

    let mut cache = AnalysisCache::default();
    assert!(cache.is_reload_needed(&path)?);
    let first = cache.get_or_analyse(&path)?.clone();
    assert!(!cache.is_reload_needed(&path)?);
    assert_eq!(cache.len(), 1);

    std::fs::write(&path, r#"{"traceEvents": []}"#)?;
    assert!(cache.is_reload_needed(&path)?);
    let second = cache.get_or_analyse(&path)?.clone();
    assert_ne!(first, second);
    assert_eq!(second.duration, 0.0);

    cache.remove(&path);
    assert!(cache.is_empty());
    std::fs::remove_file(&path)?;

    Ok(())
}

#[test]
fn test_failures_stay_local() -> eyre::Result<()> {
    let good = mktemp::Temp::new_file()?;
    let good_path = good.with_extension("json");
    std::fs::write(&good_path, BUILD_TRACE)?;
    let bad = mktemp::Temp::new_file()?;
    let bad_path = bad.with_extension("json");
    std::fs::write(&bad_path, "not json")?;

    let outcomes = analyse_files(&[bad_path.clone(), good_path.clone()]);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[1].1.is_ok());
    // The decoder's position survives into the logged message.
    let Err(error) = &outcomes[0].1 else {
        panic!("Expected {bad_path:?} to fail");
    };
    assert!(format!("{error:#}").contains("line 1"), "{error:#}");

    std::fs::remove_file(&good_path)?;
    std::fs::remove_file(&bad_path)?;

    Ok(())
}
