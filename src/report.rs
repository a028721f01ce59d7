use std::cmp::Reverse;

use crate::{
    json::{ArgValue, TraceEvent, TraceProfile},
    timings::{BuildStats, BuildTiming, BuildTimings, TimingKind},
};

const REPORT_PID: i64 = 1;

/// One “thread” per summary track.
const PARSE_TIME_TID: i64 = 1;
const PARSE_COUNT_TID: i64 = 2;
const PARSE_SELF_TID: i64 = 3;
const OPTIMIZE_TIME_TID: i64 = 4;
const BUILD_TOTALS_TID: i64 = 5;
static TRACKS: &[(i64, &str)] = &[
    (PARSE_TIME_TID, "ParseTime"),
    (PARSE_COUNT_TID, "ParseCount"),
    (PARSE_SELF_TID, "ParseSelf"),
    (OPTIMIZE_TIME_TID, "OptimizeTime"),
    (BUILD_TOTALS_TID, "Build Totals"),
];

/// Width of one occurrence on the ParseCount track, in microseconds. Not a time, it just makes
/// the bars proportional to the count.
const PARSE_COUNT_SCALE: i64 = 10000;

/// Lays out merged timings and stats as a trace the renderer can show.
///
/// Each timing track is sorted by duration, largest first, with bars placed end to end from
/// zero. The Build Totals track models the compiler's phases, so its bars nest.
pub fn synthesize(timings: &BuildTimings, stats: &BuildStats) -> TraceProfile {
    let mut events = TRACKS
        .iter()
        .map(|&(tid, name)| TraceEvent::metadata("thread_name", REPORT_PID, Some(tid), name))
        .collect::<Vec<_>>();

    for timing in timings.values() {
        match timing.kind {
            TimingKind::Parse => {
                events.push(timing_event(timing, PARSE_TIME_TID, timing.duration));
                let count = i64::try_from(timing.count).unwrap_or(i64::MAX);
                events.push(timing_event(
                    timing,
                    PARSE_COUNT_TID,
                    count.saturating_mul(PARSE_COUNT_SCALE),
                ));
                if timing.self_duration() > 0 {
                    events.push(timing_event(timing, PARSE_SELF_TID, timing.self_duration()));
                }
            }
            TimingKind::Optimize => {
                events.push(timing_event(timing, OPTIMIZE_TIME_TID, timing.duration));
            }
        }
    }

    events.sort_by(|p, q| {
        (!p.is_metadata(), p.tid, Reverse(p.dur), &p.name).cmp(&(
            !q.is_metadata(),
            q.tid,
            Reverse(q.dur),
            &q.name,
        ))
    });

    // Place each track's bars end to end.
    let mut track = None;
    let mut ts = 0;
    for event in events.iter_mut().filter(|e| e.is_complete()) {
        if event.tid != track {
            track = event.tid;
            ts = 0;
        }
        event.ts = Some(ts);
        ts = ts.saturating_add(event.dur.unwrap_or(0));
    }

    events.extend(build_totals(stats));

    TraceProfile {
        traceEvents: events,
        beginningOfTime: None,
    }
}

/// The last component of a `/` or `\` separated path.
pub fn short_file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn timing_event(timing: &BuildTiming, tid: i64, dur: i64) -> TraceEvent {
    let micros = if tid == PARSE_SELF_TID {
        timing.self_duration()
    } else {
        timing.duration
    };
    let seconds = micros as f64 * 1e-6;
    let name = format!(
        "{} {}x {:.3}s",
        short_file_name(&timing.name),
        timing.count,
        seconds
    );
    TraceEvent {
        args: [("detail".to_owned(), ArgValue::String(timing.name.clone()))]
            .into_iter()
            .collect(),
        ..TraceEvent::complete(name, REPORT_PID, tid, 0, dur)
    }
}

/// Nested bars for the compiler's phase totals.
///
/// The totals come from the compiler's own bookkeeping and don't always add up, so sub-phases
/// are clamped to their parent phase, or the renderer rejects the track.
fn build_totals(stats: &BuildStats) -> Vec<TraceEvent> {
    let frontend_start = stats.frontend_start.unwrap_or(0);
    let backend_start = stats
        .backend_start
        .unwrap_or(0)
        .max(frontend_start.saturating_add(stats.total_frontend));

    let instantiate_start = frontend_start.saturating_add(stats.total_source);
    let code_gen_start = instantiate_start.saturating_add(stats.total_instantiate_function);
    let code_gen_function = stats
        .total_code_gen_function
        .min(backend_start.saturating_sub(code_gen_start))
        .max(0);

    let bars = [
        ("ExecuteCompiler", 0, stats.total_execute_compiler),
        ("Frontend", frontend_start, stats.total_frontend),
        ("Source", frontend_start, stats.total_source),
        (
            "InstantiateFunction",
            instantiate_start,
            stats.total_instantiate_function,
        ),
        (
            "InstantiateClass",
            instantiate_start,
            stats
                .total_instantiate_class
                .min(stats.total_instantiate_function),
        ),
        ("CodeGenFunction", code_gen_start, code_gen_function),
        ("Backend", backend_start, stats.total_backend),
        ("Optimizer", backend_start, stats.total_optimizer),
        (
            "CodeGenPasses",
            backend_start.saturating_add(stats.total_optimizer),
            stats.total_code_gen_passes,
        ),
        (
            "OptFunction",
            backend_start,
            stats.total_opt_function.min(stats.total_optimizer),
        ),
    ];

    bars.into_iter()
        .map(|(name, ts, dur)| {
            let percent = if stats.total_execute_compiler > 0 {
                100.0 * dur as f64 / stats.total_execute_compiler as f64
            } else {
                0.0
            };
            TraceEvent {
                args: [(
                    "percent".to_owned(),
                    ArgValue::Number((percent * 10.0).round() / 10.0),
                )]
                .into_iter()
                .collect(),
                ..TraceEvent::complete(
                    format!("Total {name}"),
                    REPORT_PID,
                    BUILD_TOTALS_TID,
                    ts,
                    dur,
                )
            }
        })
        .collect()
}

#[cfg(test)]
fn timings_for(entries: &[(&str, TimingKind, usize, i64, i64)]) -> BuildTimings {
    entries
        .iter()
        .map(|&(path, kind, count, duration, subtracted_duration)| {
            (
                (kind, path.to_owned()),
                BuildTiming {
                    name: path.to_owned(),
                    kind,
                    count,
                    duration,
                    subtracted_duration,
                },
            )
        })
        .collect()
}

#[cfg(test)]
fn track(profile: &TraceProfile, tid: i64) -> Vec<(&str, i64, i64)> {
    profile
        .traceEvents
        .iter()
        .filter(|e| e.is_complete() && e.tid == Some(tid))
        .map(|e| {
            (
                e.name.as_deref().unwrap_or_default(),
                e.ts.unwrap_or_default(),
                e.dur.unwrap_or_default(),
            )
        })
        .collect()
}

#[test]
fn test_short_file_name() {
    assert_eq!(short_file_name("/usr/include/c++/v1/vector"), "vector");
    assert_eq!(short_file_name(r"C:\src\main.cpp"), "main.cpp");
    assert_eq!(short_file_name("plain.h"), "plain.h");
}

#[test]
fn test_synthesize_tracks() {
    let timings = timings_for(&[
        ("/src/a.h", TimingKind::Parse, 2, 3_000_000, 1_000_000),
        ("/src/b.h", TimingKind::Parse, 5, 1_000_000, 1_000_000),
        ("/src/c.h", TimingKind::Parse, 1, 1_000_000, 0),
        ("/src/main.cpp", TimingKind::Optimize, 1, 4_000_000, 0),
    ]);
    let profile = synthesize(&timings, &BuildStats::default());

    let metadata = profile
        .traceEvents
        .iter()
        .take_while(|e| e.is_metadata())
        .filter_map(|e| e.arg_str("name"))
        .collect::<Vec<_>>();
    assert_eq!(
        metadata,
        ["ParseTime", "ParseCount", "ParseSelf", "OptimizeTime", "Build Totals"]
    );

    assert_eq!(
        track(&profile, PARSE_TIME_TID),
        [
            ("a.h 2x 3.000s", 0, 3_000_000),
            ("b.h 5x 1.000s", 3_000_000, 1_000_000),
            ("c.h 1x 1.000s", 4_000_000, 1_000_000),
        ]
    );
    assert_eq!(
        track(&profile, PARSE_COUNT_TID),
        [
            ("b.h 5x 1.000s", 0, 50_000),
            ("a.h 2x 3.000s", 50_000, 20_000),
            ("c.h 1x 1.000s", 70_000, 10_000),
        ]
    );
    // b.h has no self time left, so it has no bar.
    assert_eq!(
        track(&profile, PARSE_SELF_TID),
        [
            ("a.h 2x 2.000s", 0, 2_000_000),
            ("c.h 1x 1.000s", 2_000_000, 1_000_000),
        ]
    );
    assert_eq!(
        track(&profile, OPTIMIZE_TIME_TID),
        [("main.cpp 1x 4.000s", 0, 4_000_000)]
    );
    assert_eq!(track(&profile, BUILD_TOTALS_TID).len(), 10);
}

#[test]
fn test_build_totals_clamping() {
    let stats = BuildStats {
        frontend_start: Some(100),
        backend_start: Some(500),
        total_execute_compiler: 1000,
        total_frontend: 300,
        total_source: 100,
        total_instantiate_function: 150,
        total_instantiate_class: 400,
        total_code_gen_function: 200,
        total_backend: 400,
        total_optimizer: 250,
        total_code_gen_passes: 100,
        total_opt_function: 300,
    };
    let profile = synthesize(&BuildTimings::default(), &stats);
    let totals = track(&profile, BUILD_TOTALS_TID);
    assert_eq!(
        totals,
        [
            ("Total ExecuteCompiler", 0, 1000),
            ("Total Frontend", 100, 300),
            ("Total Source", 100, 100),
            ("Total InstantiateFunction", 200, 150),
            ("Total InstantiateClass", 200, 150),
            ("Total CodeGenFunction", 350, 150),
            ("Total Backend", 500, 400),
            ("Total Optimizer", 500, 250),
            ("Total CodeGenPasses", 750, 100),
            ("Total OptFunction", 500, 250),
        ]
    );
    let frontend = profile
        .traceEvents
        .iter()
        .find(|e| e.has_name("Total Frontend"))
        .map(|e| e.args["percent"].clone());
    assert_eq!(frontend, Some(ArgValue::Number(30.0)));
}

#[test]
fn test_backend_never_starts_inside_frontend() {
    let stats = BuildStats {
        frontend_start: Some(10),
        backend_start: Some(20),
        total_frontend: 100,
        total_backend: 5,
        ..Default::default()
    };
    let profile = synthesize(&BuildTimings::default(), &stats);
    let backend = track(&profile, BUILD_TOTALS_TID)
        .into_iter()
        .find(|&(name, _, _)| name == "Total Backend");
    assert_eq!(backend, Some(("Total Backend", 110, 5)));
    // No ExecuteCompiler total, so no percentages either.
    assert!(profile
        .traceEvents
        .iter()
        .filter(|e| e.tid == Some(BUILD_TOTALS_TID) && e.is_complete())
        .all(|e| e.args["percent"] == ArgValue::Number(0.0)));
}

#[test]
fn test_huge_totals_saturate() {
    let stats = BuildStats {
        frontend_start: Some(i64::MAX - 10),
        backend_start: Some(0),
        total_execute_compiler: i64::MAX,
        total_frontend: 100,
        total_source: 100,
        total_instantiate_function: 100,
        total_optimizer: 100,
        ..Default::default()
    };
    let totals = build_totals(&stats);
    let backend = totals
        .iter()
        .find(|e| e.has_name("Total Backend"))
        .and_then(|e| e.ts);
    assert_eq!(backend, Some(i64::MAX));

    let timings = timings_for(&[
        ("a.cpp", TimingKind::Parse, 1, i64::MAX, 0),
        ("b.cpp", TimingKind::Parse, 1, i64::MAX - 1, 0),
        ("c.cpp", TimingKind::Parse, 1, 5, 0),
    ]);
    let profile = synthesize(&timings, &BuildStats::default());
    let last = profile
        .traceEvents
        .iter()
        .filter(|e| e.tid == Some(PARSE_TIME_TID))
        .filter_map(|e| e.ts)
        .last();
    assert_eq!(last, Some(i64::MAX));
}
