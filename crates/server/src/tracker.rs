//! Pure session transition logic
//!
//! All business logic for tab sessions lives here as a pure, synchronous
//! function: `transition(input) -> effects`. No IO, no async, no locking —
//! fully unit-testable. The dispatch loop applies the returned effects.

use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};

/// Sessions shorter than this never reach the calendar.
pub fn min_event_duration() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// The currently open browsing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub url: String,
    pub started_at: NaiveDateTime,
}

/// Cumulative time spent per URL for the life of the process.
pub type UrlHistory = HashMap<String, TimeDelta>;

/// A qualifying session, ready to be written to the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub summary: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// One decoded frame, as the tracker sees it.
#[derive(Debug, Clone)]
pub enum Input {
    /// A frame that only reports where the browser is now.
    Update { url: String, time: NaiveDateTime },
    /// A frame that closes the current session and opens the next one. The
    /// frame carries the next session's URL under the previous session's
    /// closing time.
    End { url: String, time: NaiveDateTime },
}

/// Side effects the caller must apply after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The frame's timestamp was earlier than the open session's start; the
    /// elapsed time was clamped to zero.
    ClockSkew { url: String, elapsed: TimeDelta },
    /// Add `duration` to the per-URL running total.
    RecordHistory { url: String, duration: TimeDelta },
    /// Create a calendar event for a session that cleared the threshold.
    EmitEvent(CalendarEvent),
}

/// Tracks the one live session for a connection.
#[derive(Debug, Default)]
pub struct Tracker {
    open: Option<Session>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_session(&self) -> Option<&Session> {
        self.open.as_ref()
    }

    /// Apply one frame.
    ///
    /// For `End` inputs the close and the reopen happen inside this single
    /// call, so no other frame can interleave between the two steps. `Update`
    /// inputs overwrite any prior session unconditionally, without closing it.
    pub fn transition(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Update { url, time } => {
                self.open = Some(Session {
                    url,
                    started_at: time,
                });
                Vec::new()
            }
            Input::End { url, time } => {
                let effects = self.close(time);
                self.open = Some(Session {
                    url,
                    started_at: time,
                });
                effects
            }
        }
    }

    /// Compute the effects of closing the open session at `time`.
    ///
    /// Reads the session without mutating it; the caller replaces it in the
    /// explicit reopen step. With no open session there is nothing to close.
    fn close(&self, time: NaiveDateTime) -> Vec<Effect> {
        let Some(session) = &self.open else {
            return Vec::new();
        };

        let elapsed = time - session.started_at;
        let mut effects = Vec::new();

        let duration = if elapsed < TimeDelta::zero() {
            effects.push(Effect::ClockSkew {
                url: session.url.clone(),
                elapsed,
            });
            TimeDelta::zero()
        } else {
            elapsed
        };

        effects.push(Effect::RecordHistory {
            url: session.url.clone(),
            duration,
        });

        if duration >= min_event_duration() {
            effects.push(Effect::EmitEvent(CalendarEvent {
                summary: session.url.clone(),
                start: session.started_at,
                end: time,
            }));
        }

        effects
    }
}
