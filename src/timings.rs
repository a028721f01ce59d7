use std::collections::BTreeMap;

use tracing::debug;

use crate::json::TraceEvent;

/// Event names that carry a file path in `args.detail`.
static PARSE_EVENT: &str = "Source";
static OPTIMIZE_EVENT: &str = "OptModule";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimingKind {
    /// From `Source` events, one per included file.
    Parse,
    /// From `OptModule` events, one per translation unit.
    Optimize,
}

/// Accumulated contribution of one file, across every event and every trace that mentions it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildTiming {
    pub name: String,
    pub kind: TimingKind,
    pub count: usize,
    pub duration: i64,
    pub subtracted_duration: i64,
}

pub type BuildTimings = BTreeMap<(TimingKind, String), BuildTiming>;

/// Totals of the `Total <Name>` summary events clang writes at the end of a trace, plus the
/// start of the first `Frontend` and `Backend` events. All values are microseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub frontend_start: Option<i64>,
    pub backend_start: Option<i64>,

    pub total_execute_compiler: i64,

    pub total_frontend: i64,
    pub total_source: i64,
    pub total_instantiate_function: i64,
    pub total_instantiate_class: i64,
    pub total_code_gen_function: i64,

    pub total_backend: i64,
    pub total_optimizer: i64,
    pub total_code_gen_passes: i64,
    pub total_opt_function: i64,
}

impl BuildTiming {
    pub fn new(name: &str, kind: TimingKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            count: 0,
            duration: 0,
            subtracted_duration: 0,
        }
    }

    /// Adds one occurrence.
    pub fn combine(&mut self, duration: i64, subtracted_duration: i64) {
        self.count += 1;
        self.duration = self.duration.saturating_add(duration);
        self.subtracted_duration = self.subtracted_duration.saturating_add(subtracted_duration);
    }

    /// Adds everything another accumulator has seen.
    pub fn merge(&mut self, other: &BuildTiming) {
        self.count = self.count.saturating_add(other.count);
        self.duration = self.duration.saturating_add(other.duration);
        self.subtracted_duration = self
            .subtracted_duration
            .saturating_add(other.subtracted_duration);
    }

    pub fn self_duration(&self) -> i64 {
        self.duration.saturating_sub(self.subtracted_duration)
    }
}

impl TimingKind {
    fn from_event_name(name: &str) -> Option<Self> {
        if name == PARSE_EVENT {
            Some(Self::Parse)
        } else if name == OPTIMIZE_EVENT {
            Some(Self::Optimize)
        } else {
            None
        }
    }
}

/// Collects `Source` and `OptModule` events by path.
///
/// Run [crate::hierarchy::compute_parents_and_self_time] first, or every self duration will equal
/// its duration.
pub fn extract_build_timings(events: &[TraceEvent]) -> BuildTimings {
    let mut result = BuildTimings::default();
    for event in events {
        let Some(kind) = event.name.as_deref().and_then(TimingKind::from_event_name) else {
            continue;
        };
        let Some((start, end)) = event.interval() else {
            continue;
        };
        let Some(path) = event.arg_str("detail") else {
            debug!(?event, "Skipping event without detail");
            continue;
        };
        result
            .entry((kind, path.to_owned()))
            .or_insert_with(|| BuildTiming::new(path, kind))
            .combine(end - start, event.subtracted_duration);
    }

    result
}

pub fn extract_build_stats(events: &[TraceEvent]) -> BuildStats {
    let mut result = BuildStats::default();
    for event in events {
        let (Some(name), Some((start, end))) = (event.name.as_deref(), event.interval()) else {
            continue;
        };
        match name {
            "Frontend" => result.frontend_start = Some(earliest(result.frontend_start, start)),
            "Backend" => result.backend_start = Some(earliest(result.backend_start, start)),
            _ => {
                if let Some(total) = name
                    .strip_prefix("Total ")
                    .and_then(|name| result.total_mut(name))
                {
                    *total = total.saturating_add(end - start);
                }
            }
        }
    }

    result
}

/// Sums per-file timings. The result doesn't depend on the order or grouping of the inputs.
pub fn merge_build_timings(per_file: impl IntoIterator<Item = BuildTimings>) -> BuildTimings {
    per_file
        .into_iter()
        .fold(BuildTimings::default(), merge_build_timings_into)
}

pub fn merge_build_timings_into(mut result: BuildTimings, other: BuildTimings) -> BuildTimings {
    for (key, timing) in other {
        match result.get_mut(&key) {
            Some(existing) => existing.merge(&timing),
            None => {
                result.insert(key, timing);
            }
        }
    }

    result
}

pub fn merge_build_stats(per_file: impl IntoIterator<Item = BuildStats>) -> BuildStats {
    per_file
        .into_iter()
        .fold(BuildStats::default(), |mut result, stats| {
            result.combine(&stats);
            result
        })
}

impl BuildStats {
    /// `(name, total)` pairs, in the order the report lays them out.
    pub fn totals(&self) -> [(&'static str, i64); 10] {
        [
            ("ExecuteCompiler", self.total_execute_compiler),
            ("Frontend", self.total_frontend),
            ("Source", self.total_source),
            ("InstantiateFunction", self.total_instantiate_function),
            ("InstantiateClass", self.total_instantiate_class),
            ("CodeGenFunction", self.total_code_gen_function),
            ("Backend", self.total_backend),
            ("Optimizer", self.total_optimizer),
            ("CodeGenPasses", self.total_code_gen_passes),
            ("OptFunction", self.total_opt_function),
        ]
    }

    fn total_mut(&mut self, name: &str) -> Option<&mut i64> {
        Some(match name {
            "ExecuteCompiler" => &mut self.total_execute_compiler,
            "Frontend" => &mut self.total_frontend,
            "Source" => &mut self.total_source,
            "InstantiateFunction" => &mut self.total_instantiate_function,
            "InstantiateClass" => &mut self.total_instantiate_class,
            "CodeGenFunction" => &mut self.total_code_gen_function,
            "Backend" => &mut self.total_backend,
            "Optimizer" => &mut self.total_optimizer,
            "CodeGenPasses" => &mut self.total_code_gen_passes,
            "OptFunction" => &mut self.total_opt_function,
            _ => return None,
        })
    }

    pub fn combine(&mut self, rhs: &BuildStats) {
        self.frontend_start = add_starts(self.frontend_start, rhs.frontend_start);
        self.backend_start = add_starts(self.backend_start, rhs.backend_start);

        for (name, total) in rhs.totals() {
            if let Some(sum) = self.total_mut(name) {
                *sum = sum.saturating_add(total);
            }
        }
    }

    /// Turns a sum over `n` files into a per-file average. The sums are lost.
    pub fn divide_by(&mut self, n: usize) {
        let Ok(n) = i64::try_from(n) else {
            return;
        };
        if n == 0 {
            return;
        }
        self.frontend_start = self.frontend_start.map(|s| s / n);
        self.backend_start = self.backend_start.map(|s| s / n);

        self.total_execute_compiler /= n;

        self.total_frontend /= n;
        self.total_source /= n;
        self.total_instantiate_function /= n;
        self.total_instantiate_class /= n;
        self.total_code_gen_function /= n;

        self.total_backend /= n;
        self.total_optimizer /= n;
        self.total_code_gen_passes /= n;
        self.total_opt_function /= n;
    }
}

fn earliest(start: Option<i64>, ts: i64) -> i64 {
    start.map_or(ts, |start| start.min(ts))
}

fn add_starts(lhs: Option<i64>, rhs: Option<i64>) -> Option<i64> {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => Some(lhs.saturating_add(rhs)),
        (lhs, rhs) => lhs.or(rhs),
    }
}

#[cfg(test)]
fn source(ts: i64, dur: i64, path: &str) -> TraceEvent {
    use crate::json::ArgValue;

    TraceEvent {
        args: [("detail".to_owned(), ArgValue::String(path.to_owned()))]
            .into_iter()
            .collect(),
        ..TraceEvent::complete("Source".to_owned(), 1, 1, ts, dur)
    }
}

#[cfg(test)]
fn timings_for(paths: &[(&str, i64, i64)]) -> BuildTimings {
    let mut result = BuildTimings::default();
    for &(path, dur, subtracted) in paths {
        result
            .entry((TimingKind::Parse, path.to_owned()))
            .or_insert_with(|| BuildTiming::new(path, TimingKind::Parse))
            .combine(dur, subtracted);
    }
    result
}

#[test]
fn test_extract_build_timings() {
    let mut events = vec![
        source(0, 100, "a.h"),
        source(10, 20, "b.h"),
        source(200, 50, "b.h"),
        TraceEvent {
            args: [(
                "detail".to_owned(),
                crate::json::ArgValue::String("main.cpp".to_owned()),
            )]
            .into_iter()
            .collect(),
            ..TraceEvent::complete("OptModule".to_owned(), 1, 1, 300, 40)
        },
        // No detail, so skipped rather than failing the file.
        TraceEvent::complete("Source".to_owned(), 1, 1, 400, 10),
    ];
    crate::hierarchy::compute_parents_and_self_time(&mut events);
    let timings = extract_build_timings(&events);
    assert_eq!(timings.len(), 3);

    let a = &timings[&(TimingKind::Parse, "a.h".to_owned())];
    assert_eq!((a.count, a.duration, a.self_duration()), (1, 100, 80));
    let b = &timings[&(TimingKind::Parse, "b.h".to_owned())];
    assert_eq!((b.count, b.duration, b.self_duration()), (2, 70, 70));
    let main = &timings[&(TimingKind::Optimize, "main.cpp".to_owned())];
    assert_eq!((main.kind, main.count, main.duration), (TimingKind::Optimize, 1, 40));
}

#[test]
fn test_extract_build_stats() {
    let events = [
        TraceEvent::complete("Frontend".to_owned(), 1, 1, 50, 100),
        TraceEvent::complete("Frontend".to_owned(), 1, 1, 20, 10),
        TraceEvent::complete("Backend".to_owned(), 1, 1, 300, 100),
        TraceEvent::complete("Total ExecuteCompiler".to_owned(), 1, 2, 0, 1000),
        TraceEvent::complete("Total InstantiateClass".to_owned(), 1, 3, 0, 70),
        TraceEvent::complete("Total Unknown".to_owned(), 1, 4, 0, 5),
    ];
    let stats = extract_build_stats(&events);
    assert_eq!(stats.frontend_start, Some(20));
    assert_eq!(stats.backend_start, Some(300));
    assert_eq!(stats.total_execute_compiler, 1000);
    assert_eq!(stats.total_instantiate_class, 70);
    assert_eq!(stats.total_frontend, 0);
}

#[test]
fn test_merge_is_associative_and_commutative() {
    use rand::{seq::SliceRandom, Rng};

    let files = [
        timings_for(&[("a.h", 10, 2), ("b.h", 5, 0)]),
        timings_for(&[("a.h", 7, 7), ("c.h", 1, 0), ("a.h", 3, 0)]),
        timings_for(&[("b.h", 100, 40)]),
        timings_for(&[]),
        timings_for(&[("c.h", 9, 1)]),
    ];
    let expected = merge_build_timings(files.clone());
    let a = &expected[&(TimingKind::Parse, "a.h".to_owned())];
    assert_eq!((a.count, a.duration, a.self_duration()), (3, 20, 11));

    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let mut shuffled = files.to_vec();
        shuffled.shuffle(&mut rng);
        let split = rng.gen_range(0..=shuffled.len());
        let right = shuffled.split_off(split);
        let merged = merge_build_timings([merge_build_timings(shuffled), merge_build_timings(right)]);
        assert_eq!(merged, expected);
    }
}

#[test]
fn test_stats_combine_and_divide() {
    let first = BuildStats {
        frontend_start: Some(10),
        total_execute_compiler: 100,
        total_opt_function: 4,
        ..Default::default()
    };
    let second = BuildStats {
        frontend_start: Some(30),
        backend_start: Some(80),
        total_execute_compiler: 300,
        total_opt_function: 8,
        ..Default::default()
    };
    let third = BuildStats {
        total_source: 9,
        ..Default::default()
    };

    let mut left = merge_build_stats([first.clone(), second.clone()]);
    left.combine(&third);
    let right = merge_build_stats([third, second, first]);
    assert_eq!(left, right);

    left.divide_by(2);
    assert_eq!(left.frontend_start, Some(20));
    assert_eq!(left.backend_start, Some(40));
    assert_eq!(left.total_execute_compiler, 200);
    assert_eq!(left.total_opt_function, 6);
    assert_eq!(left.total_source, 4);
}
