//! Drag gesture coalescing.
//!
//! DESIGN
//! ======
//! Per-entity state table, no timers of its own. The owner feeds samples with
//! the current instant and polls [`DragCoalescer::next_deadline`] /
//! [`DragCoalescer::take_due`] from its event loop, so every "timer callback"
//! runs against the latest table.
//!
//! ```text
//! IDLE --begin--> DRAGGING --end(moved past threshold)--> COMMIT SCHEDULED
//!                    |                                        |
//!                    +--end(within threshold)--> IDLE         +--debounce elapsed--> emit
//! ```
//!
//! Samples inside a gesture are throttled and only ever used for local preview.
//! Nothing is previewed until the gesture has moved past the threshold, so a
//! click leaves the entity where it was. The network sees one position per
//! gesture at most, after the debounce.
//!
//! TRADE-OFFS
//! ==========
//! A new gesture on an entity cancels that entity's scheduled commit. If the
//! new gesture turns out to be a click, the cancelled commit's position is
//! still committed when it ends, since local state already shows it.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::debug;

use crate::config::DragConfig;
use crate::model::Position;

/// A position ready to be transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct DragCommit {
    pub entity: String,
    pub position: Position,
}

#[derive(Debug, Clone)]
struct DragSession {
    start: Position,
    last: Position,
    exceeded: bool,
    last_sample_at: Option<Instant>,
    /// A cancelled commit from the previous gesture still needs to go out.
    inherited: bool,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledCommit {
    position: Position,
    due: Instant,
}

pub struct DragCoalescer {
    config: DragConfig,
    sessions: HashMap<String, DragSession>,
    scheduled: HashMap<String, ScheduledCommit>,
}

impl DragCoalescer {
    #[must_use]
    pub fn new(config: DragConfig) -> Self {
        Self { config, sessions: HashMap::new(), scheduled: HashMap::new() }
    }

    /// Start a gesture. Cancels any commit still waiting out its debounce.
    pub fn begin(&mut self, entity: &str, start: Position) {
        let inherited = self.scheduled.remove(entity).is_some();
        if inherited {
            debug!(entity, "drag: new gesture cancels scheduled commit");
        }
        self.sessions.insert(
            entity.to_owned(),
            DragSession { start, last: start, exceeded: false, last_sample_at: None, inherited },
        );
    }

    /// Feed one pointer sample. Returns the position to preview once the
    /// gesture counts as a drag and the throttle window admits an update.
    pub fn sample(&mut self, entity: &str, position: Position, now: Instant) -> Option<Position> {
        let Some(session) = self.sessions.get_mut(entity) else {
            debug!(entity, "drag: sample without active gesture");
            return None;
        };

        if session.start.distance_to(position) > self.config.threshold_px {
            session.exceeded = true;
        }
        if !session.exceeded && !session.inherited {
            return None;
        }

        let admitted = session
            .last_sample_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.throttle);
        if !admitted {
            return None;
        }
        session.last = position;
        session.last_sample_at = Some(now);
        Some(position)
    }

    /// Finish a gesture at `position`. Returns `true` when a commit was scheduled.
    pub fn end(&mut self, entity: &str, position: Position, now: Instant) -> bool {
        let Some(session) = self.sessions.remove(entity) else {
            debug!(entity, "drag: end without active gesture");
            return false;
        };

        let moved = session.exceeded || session.start.distance_to(position) > self.config.threshold_px;
        if !moved && !session.inherited {
            debug!(entity, "drag: within threshold, treated as click");
            return false;
        }

        self.scheduled.insert(entity.to_owned(), ScheduledCommit { position, due: now + self.config.debounce });
        true
    }

    #[must_use]
    pub fn is_dragging(&self, entity: &str) -> bool {
        self.sessions.contains_key(entity)
    }

    /// Last previewed position of an active gesture.
    #[must_use]
    pub fn preview(&self, entity: &str) -> Option<Position> {
        self.sessions.get(entity).map(|s| s.last)
    }

    /// Earliest instant at which [`take_due`](Self::take_due) will return something.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.values().map(|c| c.due).min()
    }

    /// Remove and return commits whose debounce has elapsed, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<DragCommit> {
        let mut due: Vec<(Instant, DragCommit)> = Vec::new();
        self.scheduled.retain(|entity, commit| {
            if commit.due > now {
                return true;
            }
            due.push((commit.due, DragCommit { entity: entity.clone(), position: commit.position }));
            false
        });
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.entity.cmp(&b.1.entity)));
        due.into_iter().map(|(_, commit)| commit).collect()
    }

    /// Teardown: emit every scheduled commit now, plus the last preview of any
    /// gesture that had already moved past the threshold.
    pub fn flush(&mut self) -> Vec<DragCommit> {
        let mut out: Vec<DragCommit> = self
            .scheduled
            .drain()
            .map(|(entity, commit)| DragCommit { entity, position: commit.position })
            .collect();
        out.extend(
            self.sessions
                .drain()
                .filter(|(_, s)| s.exceeded || s.inherited)
                .map(|(entity, s)| DragCommit { entity, position: s.last }),
        );
        out.sort_by(|a, b| a.entity.cmp(&b.entity));
        out
    }

    /// Teardown without sending anything.
    pub fn discard(&mut self) {
        self.sessions.clear();
        self.scheduled.clear();
    }
}

#[cfg(test)]
#[path = "drag_test.rs"]
mod tests;
