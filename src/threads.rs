use std::{collections::BTreeMap, fmt::Write};

use crate::json::TraceEvent;

/// Memory traces mark deallocations with this name.
pub static FREE_NAME: &str = "Free";

/// Occupancy of one thread, built from a single scan of a file's events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: Option<String>,
    /// `[start, end)` watermarks of non-Free events.
    range: Option<(i64, i64)>,
    /// `[start, end)` watermarks of Free events.
    free_range: Option<(i64, i64)>,
    pub count: usize,
}

/// Wall time covered by the complete events, in seconds.
pub fn compute_duration(events: &[TraceEvent]) -> f64 {
    let range = events
        .iter()
        .filter_map(|e| e.interval())
        .fold(None, |range, (start, end)| widen(range, start, end));

    range.map_or(0.0, |(start, end)| seconds_between(start, end))
}

pub fn compute_thread_info(events: &[TraceEvent]) -> BTreeMap<i64, ThreadInfo> {
    let mut names = BTreeMap::default();
    let mut result = BTreeMap::<i64, ThreadInfo>::default();
    for event in events {
        let Some(tid) = event.tid else {
            continue;
        };
        if event.is_metadata() && event.has_name("thread_name") {
            if let Some(name) = event.arg_str("name") {
                names.insert(tid, name.to_owned());
            }
        } else if let Some((start, end)) = event.interval() {
            result
                .entry(tid)
                .or_insert_with(|| ThreadInfo::new(tid))
                .combine(start, end - start, event.name.as_deref().unwrap_or_default());
        }
    }
    for (tid, name) in names {
        if let Some(info) = result.get_mut(&tid) {
            info.name = Some(name);
        }
    }

    result
}

/// One line per thread, in ascending thread id order.
pub fn thread_summary(threads: &BTreeMap<i64, ThreadInfo>) -> String {
    let mut result = String::default();
    for info in threads.values() {
        // Writing to a String never fails.
        let _ = writeln!(result, "{info}");
    }

    result
}

impl ThreadInfo {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Events whose end doesn't fit in an i64 are ignored.
    pub fn combine(&mut self, start: i64, duration: i64, name: &str) {
        let Some(end) = start.checked_add(duration) else {
            return;
        };
        if name == FREE_NAME {
            self.free_range = widen(self.free_range, start, end);
        } else {
            self.range = widen(self.range, start, end);
        }
        self.count += 1;
    }

    /// Watermarks of the non-Free events, or of the Free events if the thread has nothing else.
    pub fn primary_range(&self) -> Option<(i64, i64)> {
        self.range.or(self.free_range)
    }

    pub fn start(&self) -> Option<i64> {
        self.primary_range().map(|(start, _)| start)
    }

    pub fn end(&self) -> Option<i64> {
        self.primary_range().map(|(_, end)| end)
    }

    pub fn free_end(&self) -> Option<i64> {
        self.free_range.map(|(_, end)| end)
    }

    /// Seconds between the primary watermarks.
    pub fn duration(&self) -> f64 {
        self.primary_range()
            .map_or(0.0, |(start, end)| seconds_between(start, end))
    }

    /// Seconds from the primary start until the last Free ends.
    pub fn free_duration(&self) -> f64 {
        match (self.start(), self.free_end()) {
            (Some(start), Some(free_end)) => seconds_between(start, free_end),
            _ => self.duration(),
        }
    }

    pub fn percentage(&self) -> f64 {
        let free_duration = self.free_duration();
        if free_duration > 0.0 {
            100.0 * self.duration() / free_duration
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        write!(f, ": {:.3}s", self.duration())?;
        let percentage = self.percentage();
        // Only interesting when Free blocks stretched the range.
        if percentage.round() != 100.0 {
            write!(f, " {percentage:.0}%")?;
        }
        write!(f, " {}x", self.count)
    }
}

/// Widened ranges can be wider than an i64, so subtract as floats.
fn seconds_between(start: i64, end: i64) -> f64 {
    (end as f64 - start as f64) * 1e-6
}

fn widen(range: Option<(i64, i64)>, start: i64, end: i64) -> Option<(i64, i64)> {
    Some(match range {
        Some((min, max)) => (min.min(start), max.max(end)),
        None => (start, end),
    })
}

#[cfg(test)]
fn event(tid: i64, ts: i64, dur: i64, name: &str) -> TraceEvent {
    TraceEvent::complete(name.to_owned(), 1, tid, ts, dur)
}

#[test]
fn test_compute_duration_is_order_independent() {
    use rand::seq::SliceRandom;

    let mut events = vec![
        event(1, 0, 100, "a"),
        event(1, 50, 30, "b"),
        TraceEvent::metadata("thread_name", 1, Some(1), "main"),
        TraceEvent {
            dur: None,
            ..event(1, 500, 0, "no duration")
        },
    ];
    for _ in 0..10 {
        events.shuffle(&mut rand::thread_rng());
        assert!((compute_duration(&events) - 0.0001).abs() < 1e-12);
    }
}

#[test]
fn test_no_complete_events() {
    let events = [
        TraceEvent::metadata("thread_name", 1, Some(1), "main"),
        TraceEvent::metadata("process_name", 1, None, "clang"),
    ];
    assert_eq!(compute_duration(&events), 0.0);
    assert!(compute_thread_info(&events).is_empty());
    assert_eq!(compute_duration(&[]), 0.0);
}

#[test]
fn test_free_blocks() {
    let threads = compute_thread_info(&[event(1, 0, 10, "Alloc"), event(1, 20, 5, "Free")]);
    let info = &threads[&1];
    assert_eq!(info.end(), Some(10));
    assert_eq!(info.free_end(), Some(25));
    assert_eq!(info.count, 2);
    assert!((info.percentage() - 40.0).abs() < 1e-9);
    assert_eq!(info.to_string(), "1: 0.000s 40% 2x");

    // Same answer when the Free arrives first.
    let threads = compute_thread_info(&[event(1, 20, 5, "Free"), event(1, 0, 10, "Alloc")]);
    assert_eq!(threads[&1].end(), Some(10));
    assert!((threads[&1].percentage() - 40.0).abs() < 1e-9);
}

#[test]
fn test_thread_summary() {
    let threads = compute_thread_info(&[
        event(2, 0, 2_000_000, "Alloc"),
        TraceEvent::metadata("thread_name", 1, Some(2), "heap"),
        event(1, 0, 1_500_000, "Free"),
        event(1, 500_000, 500_000, "Free"),
        TraceEvent::metadata("thread_name", 1, Some(3), "idle"),
    ]);
    assert_eq!(threads.keys().copied().collect::<Vec<_>>(), [1, 2]);
    assert_eq!(threads[&1].start(), Some(0));
    assert_eq!(threads[&1].end(), Some(1_500_000));
    assert_eq!(
        thread_summary(&threads),
        "1: 1.500s 2x\n2 heap: 2.000s 1x\n"
    );
}

#[test]
fn test_events_ending_past_the_end_of_time() -> Result<(), crate::json::DecodeError> {
    let profile = crate::json::decode(
        br#"{"traceEvents": [{"ph": "X", "tid": 1, "ts": 9223372036854775800, "dur": 100, "name": "a"}]}"#,
    )?;
    assert_eq!(compute_duration(&profile.traceEvents), 0.0);
    assert!(compute_thread_info(&profile.traceEvents).is_empty());

    let mut info = ThreadInfo::new(1);
    info.combine(i64::MAX - 5, 10, "a");
    assert_eq!((info.start(), info.count), (None, 0));

    // Watermarks spanning more than an i64 still give a duration.
    let threads = compute_thread_info(&[event(1, i64::MIN, 0, "a"), event(1, i64::MAX, 0, "b")]);
    assert!(threads[&1].duration() > 0.0);

    Ok(())
}
