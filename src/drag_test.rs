use std::time::Duration;

use super::*;

fn coalescer() -> DragCoalescer {
    DragCoalescer::new(DragConfig::default())
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn gesture_within_threshold_sends_nothing() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("users", Position::new(100.0, 100.0));
    assert_eq!(drag.sample("users", Position::new(102.0, 101.0), t0 + ms(10)), None);
    assert_eq!(drag.sample("users", Position::new(103.0, 103.0), t0 + ms(80)), None);
    assert_eq!(drag.preview("users"), Some(Position::new(100.0, 100.0)));

    assert!(!drag.end("users", Position::new(103.0, 103.0), t0 + ms(100)));
    assert!(drag.next_deadline().is_none());
    assert!(drag.take_due(t0 + ms(10_000)).is_empty());
}

#[test]
fn preview_starts_once_threshold_is_crossed() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("users", Position::new(0.0, 0.0));

    assert_eq!(drag.sample("users", Position::new(3.0, 0.0), t0), None);
    assert_eq!(drag.sample("users", Position::new(12.0, 0.0), t0 + ms(5)), Some(Position::new(12.0, 0.0)));
    assert_eq!(drag.sample("users", Position::new(2.0, 0.0), t0 + ms(60)), Some(Position::new(2.0, 0.0)));
}

#[test]
fn wandering_back_inside_threshold_still_counts_as_drag() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("users", Position::new(0.0, 0.0));
    drag.sample("users", Position::new(40.0, 0.0), t0 + ms(10));

    assert!(drag.end("users", Position::new(1.0, 0.0), t0 + ms(20)));
}

#[test]
fn drag_commits_once_after_debounce() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("users", Position::new(0.0, 0.0));
    drag.sample("users", Position::new(30.0, 0.0), t0 + ms(10));
    assert!(drag.end("users", Position::new(60.0, 10.0), t0 + ms(50)));

    let deadline = drag.next_deadline().expect("scheduled");
    assert_eq!(deadline, t0 + ms(50) + ms(250));
    assert!(drag.take_due(deadline - ms(1)).is_empty());

    let commits = drag.take_due(deadline);
    assert_eq!(commits, vec![DragCommit { entity: "users".into(), position: Position::new(60.0, 10.0) }]);
    assert!(drag.take_due(deadline + ms(1_000)).is_empty());
}

#[test]
fn second_gesture_inside_debounce_yields_single_final_commit() {
    let mut drag = coalescer();
    let t0 = Instant::now();

    drag.begin("users", Position::new(0.0, 0.0));
    drag.sample("users", Position::new(50.0, 0.0), t0 + ms(10));
    assert!(drag.end("users", Position::new(50.0, 0.0), t0 + ms(20)));

    drag.begin("users", Position::new(50.0, 0.0));
    assert!(drag.next_deadline().is_none());
    drag.sample("users", Position::new(120.0, 40.0), t0 + ms(100));
    assert!(drag.end("users", Position::new(120.0, 40.0), t0 + ms(120)));

    let commits = drag.take_due(t0 + ms(10_000));
    assert_eq!(commits, vec![DragCommit { entity: "users".into(), position: Position::new(120.0, 40.0) }]);
}

#[test]
fn click_after_drag_still_commits_the_cancelled_position() {
    let mut drag = coalescer();
    let t0 = Instant::now();

    drag.begin("users", Position::new(0.0, 0.0));
    assert!(drag.end("users", Position::new(80.0, 0.0), t0));

    drag.begin("users", Position::new(80.0, 0.0));
    assert!(drag.end("users", Position::new(81.0, 0.0), t0 + ms(30)));

    let commits = drag.take_due(t0 + ms(1_000));
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].position, Position::new(81.0, 0.0));
}

#[test]
fn samples_are_throttled() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("users", Position::new(0.0, 0.0));

    assert_eq!(drag.sample("users", Position::new(10.0, 0.0), t0), Some(Position::new(10.0, 0.0)));
    assert_eq!(drag.sample("users", Position::new(20.0, 0.0), t0 + ms(20)), None);
    assert_eq!(drag.preview("users"), Some(Position::new(10.0, 0.0)));
    assert_eq!(drag.sample("users", Position::new(30.0, 0.0), t0 + ms(50)), Some(Position::new(30.0, 0.0)));
}

#[test]
fn entities_are_independent() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("a", Position::new(0.0, 0.0));
    drag.begin("b", Position::new(0.0, 0.0));
    assert!(drag.end("a", Position::new(100.0, 0.0), t0));
    assert!(drag.end("b", Position::new(0.0, 100.0), t0 + ms(100)));

    let first = drag.take_due(t0 + ms(260));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].entity, "a");
    let second = drag.take_due(t0 + ms(400));
    assert_eq!(second[0].entity, "b");
}

#[test]
fn sample_and_end_without_begin_are_ignored() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    assert_eq!(drag.sample("ghost", Position::new(10.0, 0.0), t0), None);
    assert!(!drag.end("ghost", Position::new(10.0, 0.0), t0));
    assert!(!drag.is_dragging("ghost"));
}

#[test]
fn flush_emits_scheduled_and_moved_gestures() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("a", Position::new(0.0, 0.0));
    drag.end("a", Position::new(100.0, 0.0), t0);

    drag.begin("b", Position::new(0.0, 0.0));
    drag.sample("b", Position::new(0.0, 90.0), t0);

    drag.begin("c", Position::new(0.0, 0.0));
    drag.sample("c", Position::new(1.0, 0.0), t0);

    let flushed = drag.flush();
    let entities: Vec<&str> = flushed.iter().map(|c| c.entity.as_str()).collect();
    assert_eq!(entities, vec!["a", "b"]);
    assert!(drag.next_deadline().is_none());
    assert!(!drag.is_dragging("c"));
}

#[test]
fn discard_drops_everything() {
    let mut drag = coalescer();
    let t0 = Instant::now();
    drag.begin("a", Position::new(0.0, 0.0));
    drag.end("a", Position::new(100.0, 0.0), t0);
    drag.begin("b", Position::new(0.0, 0.0));

    drag.discard();
    assert!(drag.next_deadline().is_none());
    assert!(!drag.is_dragging("b"));
    assert!(drag.flush().is_empty());
}
