use std::cmp::Reverse;

use tracing::{debug, trace};

use crate::json::{ArgValue, TraceEvent};

/// The thread whose call tree we reconstruct.
///
/// This is the lowest thread id named by a metadata event, which for clang build traces is the
/// compiler's main thread. Traces without metadata fall back to the lowest thread id with a
/// complete event.
pub fn subject_thread(events: &[TraceEvent]) -> Option<i64> {
    events
        .iter()
        .filter(|e| e.is_metadata())
        .filter_map(|e| e.tid)
        .min()
        .or_else(|| {
            events
                .iter()
                .filter(|e| e.interval().is_some())
                .filter_map(|e| e.tid)
                .min()
        })
}

/// Fills in [TraceEvent::parent] and [TraceEvent::subtracted_duration] for the complete events on
/// the [subject_thread], and clears them everywhere else.
///
/// Parents are found purely by interval containment. Once the events are sorted by start time
/// (longest first on ties), every event's parent is either the previous event or one of that
/// event's ancestors, so walking up from the previous event is enough.
pub fn compute_parents_and_self_time(events: &mut [TraceEvent]) {
    for event in events.iter_mut() {
        event.parent = None;
        event.subtracted_duration = 0;
    }

    let Some(subject) = subject_thread(events) else {
        return;
    };
    debug!(subject, "Reconstructing hierarchy");

    let mut order = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.tid == Some(subject))
        .filter_map(|(i, e)| e.interval().map(|(start, end)| (i, start, end)))
        .collect::<Vec<_>>();
    // Later events win ties, so a duplicate written after its twin is treated as the outer one.
    order.sort_by_key(|&(i, start, end)| (start, Reverse(end - start), Reverse(i)));

    let mut root: Option<usize> = None;
    for (i, start, end) in order {
        let mut candidate = root;
        while let Some(c) = candidate {
            let (c_start, c_end) = events[c].interval().unwrap_or_default();
            if start >= c_start && end <= c_end {
                events[i].parent = Some(c);
                if events[i].name == events[c].name {
                    let subtracted = &mut events[c].subtracted_duration;
                    *subtracted = subtracted.saturating_add(end - start);
                }
                break;
            }
            candidate = events[c].parent;
        }
        trace!(i, parent = ?events[i].parent);
        root = Some(i);
    }
}

/// Reconstructs the hierarchy and records each reconstructed event's self time in `args.self`,
/// so the renderer can show it.
pub fn annotate_self_time(events: &mut [TraceEvent]) -> usize {
    compute_parents_and_self_time(events);
    let Some(subject) = subject_thread(events) else {
        return 0;
    };

    let mut count = 0;
    for event in events
        .iter_mut()
        .filter(|e| e.tid == Some(subject) && e.interval().is_some())
    {
        let self_time = event.self_time();
        event
            .args
            .insert("self".to_owned(), ArgValue::Number(self_time as f64));
        count += 1;
    }

    count
}

#[cfg(test)]
fn event(tid: i64, ts: i64, dur: i64, name: &str) -> TraceEvent {
    TraceEvent::complete(name.to_owned(), 1, tid, ts, dur)
}

#[test]
fn test_same_name_nesting() {
    let mut events = vec![
        event(1, 10, 20, "Source"),
        event(1, 0, 100, "Source"),
        event(1, 40, 10, "Source"),
    ];
    compute_parents_and_self_time(&mut events);
    assert_eq!(events[1].parent, None);
    assert_eq!(events[0].parent, Some(1));
    assert_eq!(events[2].parent, Some(1));
    assert_eq!(events[1].self_time(), 70);
    assert_eq!(events[0].self_time(), 20);
    assert_eq!(events[2].self_time(), 10);
}

#[test]
fn test_only_same_name_children_are_subtracted() {
    let mut events = vec![
        event(1, 0, 100, "Source"),
        event(1, 10, 50, "ParseClass"),
        event(1, 20, 10, "Source"),
        event(1, 70, 20, "Source"),
    ];
    compute_parents_and_self_time(&mut events);
    assert_eq!(events[1].parent, Some(0));
    // Nested under ParseClass, so it doesn't count against the outer Source.
    assert_eq!(events[2].parent, Some(1));
    assert_eq!(events[3].parent, Some(0));
    assert_eq!(events[0].self_time(), 80);
    assert_eq!(events[1].self_time(), 50);
}

#[test]
fn test_walks_up_past_finished_siblings() {
    let mut events = vec![
        event(1, 0, 100, "A"),
        event(1, 0, 40, "A"),
        event(1, 5, 10, "A"),
        event(1, 50, 10, "A"),
        event(1, 200, 10, "A"),
    ];
    compute_parents_and_self_time(&mut events);
    assert_eq!(events[1].parent, Some(0));
    assert_eq!(events[2].parent, Some(1));
    assert_eq!(events[3].parent, Some(0));
    assert_eq!(events[4].parent, None);
    assert_eq!(events[0].self_time(), 100 - 40 - 10);
    assert_eq!(events[1].self_time(), 30);
}

#[test]
fn test_only_subject_thread_participates() {
    let mut events = vec![
        TraceEvent::metadata("thread_name", 1, Some(3), "worker"),
        TraceEvent::metadata("thread_name", 1, Some(2), "main"),
        event(2, 0, 100, "Source"),
        event(2, 10, 10, "Source"),
        event(3, 0, 100, "Source"),
        event(3, 10, 10, "Source"),
    ];
    assert_eq!(subject_thread(&events), Some(2));
    compute_parents_and_self_time(&mut events);
    assert_eq!(events[3].parent, Some(2));
    assert_eq!(events[2].self_time(), 90);
    assert_eq!(events[5].parent, None);
    assert_eq!(events[4].self_time(), 100);
}

#[test]
fn test_degenerate_intervals() {
    let mut events = vec![
        event(1, 10, 0, "Zero"),
        event(1, 10, 0, "Zero"),
        event(1, 0, 20, "Zero"),
        TraceEvent {
            dur: None,
            ..event(1, 5, 0, "Zero")
        },
    ];
    compute_parents_and_self_time(&mut events);
    // Identical intervals: the later one is the outer one.
    assert_eq!(events[1].parent, Some(2));
    assert_eq!(events[0].parent, Some(1));
    assert_eq!(events[3].parent, None);
    assert_eq!(events[2].self_time(), 20);

    // Running again gives the same answer.
    let before = events.clone();
    compute_parents_and_self_time(&mut events);
    assert_eq!(events, before);
}

#[test]
fn test_annotate_self_time() {
    let mut events = vec![
        TraceEvent::metadata("thread_name", 1, Some(1), "main"),
        event(1, 0, 100, "Source"),
        event(1, 10, 20, "Source"),
        event(2, 0, 5, "Source"),
    ];
    assert_eq!(annotate_self_time(&mut events), 2);
    assert_eq!(events[1].args["self"], ArgValue::Number(80.0));
    assert_eq!(events[2].args["self"], ArgValue::Number(20.0));
    assert!(events[0].args.get("self").is_none());
    assert!(events[3].args.is_empty());
}

#[test]
fn test_events_near_the_end_of_time() {
    let mut events = vec![
        event(1, i64::MAX - 200, 200, "Source"),
        event(1, i64::MAX - 100, 50, "Source"),
        // Ends past i64::MAX, so it has no interval and takes no part.
        event(1, i64::MAX - 7, 100, "Source"),
    ];
    compute_parents_and_self_time(&mut events);
    assert_eq!(events[1].parent, Some(0));
    assert_eq!(events[2].parent, None);
    assert_eq!(events[0].self_time(), 150);
    assert_eq!(annotate_self_time(&mut events), 2);
    assert!(events[2].args.is_empty());
}
