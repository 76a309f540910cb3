//! Loop and batch position tracking on top of a [`ClockAdapter`].
//!
//! A [`LoopTracker`] folds the adapter's unbounded beat stream into a
//! 1-indexed position within a fixed-length loop, split into contiguous
//! batches of at most `max_batch_size` beats. Only the final batch of a loop
//! can be shorter. Tracking is switched on and off by timeline markers.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde::Serialize;

use crate::audio::TrackInstance;
use crate::clock::ClockAdapter;
use crate::events::{Event, Subscription};
use crate::timeline::TimelineSnapshot;

/// Marker label that suspends tracking.
pub const DONT_TRACK: &str = "dontTrack";
/// Marker label that (re)starts tracking from the engine's current beat.
pub const DO_TRACK: &str = "doTrack";
/// Tag of marker labels that request a beat-map switch.
pub const SWITCH_MAP_TAG: &str = "switchMap";
/// Separates the switch tag from the map identifier.
pub const SWITCH_MAP_DELIMITER: char = '-';

/// Notifications published by a [`LoopTracker`].
#[derive(Debug, Default)]
pub struct TrackerEvents {
    /// Fired after every tracked beat, once all fields are up to date.
    pub update: Event<()>,
    pub loop_start: Event<()>,
    pub batch_start: Event<()>,
    pub do_track: Event<()>,
    pub dont_track: Event<()>,
    /// Carries the map identifier that followed the switch tag.
    pub switch_map: Event<str>,
}

/// Copy of every readable field of a tracker. All positions are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerState {
    pub loop_size: u32,
    pub max_batch_size: u32,
    pub tracking: bool,
    pub current_loop_beat: u32,
    pub current_batch_beat: u32,
    pub current_batch_size: u32,
    pub batch_start_beat: u32,
    pub batch_end_beat: u32,
    pub next_batch_size: u32,
    pub next_batch_start: u32,
    pub next_batch_end: u32,
}

impl TrackerState {
    fn new(loop_size: u32, max_batch_size: u32) -> Self {
        let loop_size = loop_size.max(1);
        let mut state = Self {
            loop_size,
            max_batch_size: max_batch_size.clamp(1, loop_size),
            tracking: false,
            current_loop_beat: 1,
            current_batch_beat: 1,
            current_batch_size: 1,
            batch_start_beat: 1,
            batch_end_beat: 1,
            next_batch_size: 1,
            next_batch_start: 1,
            next_batch_end: 1,
        };
        state.seat_at_loop_end();
        state
    }

    pub fn next_loop_beat(&self) -> u32 {
        (self.current_loop_beat % self.loop_size) + 1
    }

    pub fn second_next_loop_beat(&self) -> u32 {
        ((self.current_loop_beat + 1) % self.loop_size) + 1
    }

    pub fn next_batch_beat(&self) -> u32 {
        (self.current_batch_beat % self.current_batch_size) + 1
    }

    /// Size of the last batch in the loop.
    fn final_batch_size(&self) -> u32 {
        match self.loop_size % self.max_batch_size {
            0 => self.max_batch_size,
            remainder => remainder,
        }
    }

    /// Places the position on the last beat of the loop so the next tracked
    /// beat takes the wrap branch and announces the loop and batch starts.
    fn seat_at_loop_end(&mut self) {
        self.current_batch_size = self.final_batch_size();
        self.current_loop_beat = self.loop_size;
        self.current_batch_beat = self.current_batch_size;
        self.batch_end_beat = self.loop_size;
        self.batch_start_beat = self.loop_size - self.current_batch_size + 1;
        self.refresh_next_batch();
    }

    /// Places the position on `loop_beat`, deriving the batch it falls in.
    fn seat_at(&mut self, loop_beat: u32) {
        let loop_beat = loop_beat.clamp(1, self.loop_size);
        let batch_index = (loop_beat - 1) / self.max_batch_size;

        self.batch_start_beat = batch_index * self.max_batch_size + 1;
        self.current_batch_size = self
            .max_batch_size
            .min(self.loop_size - self.batch_start_beat + 1);
        self.batch_end_beat = self.batch_start_beat + self.current_batch_size - 1;
        self.current_loop_beat = loop_beat;
        self.current_batch_beat = loop_beat - self.batch_start_beat + 1;
        self.refresh_next_batch();
    }

    fn refresh_next_batch(&mut self) {
        let remaining = self.loop_size - self.batch_end_beat;
        self.next_batch_size = if remaining == 0 || remaining > self.max_batch_size {
            self.max_batch_size
        } else {
            remaining
        };

        self.next_batch_start = if self.batch_end_beat == self.loop_size {
            1
        } else {
            self.batch_end_beat + 1
        };
        self.next_batch_end = self.next_batch_start + self.next_batch_size - 1;
    }

    fn advance(&mut self) -> Option<BeatStep> {
        if !self.tracking {
            return None;
        }

        if self.current_loop_beat >= self.loop_size {
            self.current_loop_beat = 1;
            self.current_batch_beat = 1;
            self.current_batch_size = self.max_batch_size;
            self.batch_start_beat = 1;
            self.batch_end_beat = self.current_batch_size;
            self.refresh_next_batch();
            return Some(BeatStep::LoopStart);
        }

        if self.current_batch_beat >= self.current_batch_size {
            self.current_loop_beat += 1;
            self.current_batch_beat = 1;

            let beats_left = self.loop_size - self.current_loop_beat + 1;
            self.current_batch_size = beats_left.min(self.max_batch_size);
            self.batch_start_beat = self.current_loop_beat;
            self.batch_end_beat = self.current_loop_beat + self.current_batch_size - 1;
            self.refresh_next_batch();
            return Some(BeatStep::BatchStart);
        }

        self.current_loop_beat += 1;
        self.current_batch_beat += 1;
        Some(BeatStep::Within)
    }

    /// `engine_beat` is the engine's beat within its bar at the moment the
    /// marker is observed.
    fn apply_marker<'a>(&mut self, label: &'a str, engine_beat: i32) -> Option<MarkerAction<'a>> {
        match label {
            DONT_TRACK => {
                self.tracking = false;
                Some(MarkerAction::DontTrack)
            }
            DO_TRACK => {
                // The marker is seen one tick ahead of its beat, so sit one
                // beat behind and let that beat move us forward.
                if engine_beat > 1 {
                    self.seat_at((engine_beat - 1) as u32);
                } else {
                    self.seat_at_loop_end();
                }
                self.tracking = true;
                Some(MarkerAction::DoTrack)
            }
            _ => {
                let rest = label.strip_prefix(SWITCH_MAP_TAG)?;
                match rest.strip_prefix(SWITCH_MAP_DELIMITER) {
                    Some(map) if !map.is_empty() => Some(MarkerAction::SwitchMap(map)),
                    _ => {
                        tracing::warn!(label, "dropping switch marker without a map identifier");
                        None
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeatStep {
    LoopStart,
    BatchStart,
    Within,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerAction<'a> {
    DontTrack,
    DoTrack,
    SwitchMap(&'a str),
}

struct Shared {
    state: RefCell<TrackerState>,
    events: TrackerEvents,
    timeline: Arc<TimelineSnapshot>,
}

impl Shared {
    fn on_beat_updated(&self) {
        // The borrow ends before any handler runs, so handlers may read us.
        let step = self.state.borrow_mut().advance();
        let Some(step) = step else {
            return;
        };

        match step {
            BeatStep::LoopStart => {
                tracing::debug!("loop start");
                self.events.loop_start.fire();
                self.events.batch_start.fire();
            }
            BeatStep::BatchStart => self.events.batch_start.fire(),
            BeatStep::Within => {}
        }
        self.events.update.fire();
    }

    fn on_marker_updated(&self, label: &str) {
        let engine_beat = self.timeline.current_beat();
        let action = self.state.borrow_mut().apply_marker(label, engine_beat);

        match action {
            Some(MarkerAction::DontTrack) => {
                tracing::debug!("tracking disabled");
                self.events.dont_track.fire();
            }
            Some(MarkerAction::DoTrack) => {
                tracing::debug!(engine_beat, "tracking enabled");
                self.events.do_track.fire();
            }
            Some(MarkerAction::SwitchMap(map)) => self.events.switch_map.emit(map),
            None => {}
        }
    }
}

/// Maps the beat stream of one [`ClockAdapter`] onto a repeating loop.
///
/// The tracker subscribes to the adapter on construction and unsubscribes
/// when closed or dropped. It must not outlive the adapter's usefulness:
/// once the adapter is gone it simply stops receiving beats.
pub struct LoopTracker {
    shared: Rc<Shared>,
    subscriptions: Vec<Subscription>,
}

impl LoopTracker {
    /// Tracks `loop_size` beats as a single batch.
    pub fn new<T: TrackInstance>(adapter: &ClockAdapter<T>, loop_size: u32) -> Self {
        Self::with_batch(adapter, loop_size, loop_size)
    }

    /// Tracks `loop_size` beats in batches of at most `max_batch_size`.
    /// A batch size larger than the loop is clamped to the loop.
    pub fn with_batch<T: TrackInstance>(
        adapter: &ClockAdapter<T>,
        loop_size: u32,
        max_batch_size: u32,
    ) -> Self {
        if loop_size == 0 {
            tracing::warn!("loop size of zero clamped to one beat");
        }

        let shared = Rc::new(Shared {
            state: RefCell::new(TrackerState::new(loop_size, max_batch_size)),
            events: TrackerEvents::default(),
            timeline: Arc::clone(adapter.timeline()),
        });

        let beat_target = Rc::downgrade(&shared);
        let marker_target = Rc::downgrade(&shared);
        let subscriptions = vec![
            adapter.events().beat_updated.subscribe(move |_| {
                if let Some(shared) = beat_target.upgrade() {
                    shared.on_beat_updated();
                }
            }),
            adapter.events().marker_updated.subscribe(move |label: &str| {
                if let Some(shared) = marker_target.upgrade() {
                    shared.on_marker_updated(label);
                }
            }),
        ];

        Self {
            shared,
            subscriptions,
        }
    }

    /// Unsubscribes from the adapter. The tracker keeps its last position.
    pub fn close(&mut self) {
        self.subscriptions.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.subscriptions.iter().any(Subscription::is_active)
    }

    pub fn events(&self) -> &TrackerEvents {
        &self.shared.events
    }

    /// Read-only handle for event handlers that need to poll this tracker.
    pub fn view(&self) -> TrackerView {
        TrackerView {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn state(&self) -> TrackerState {
        *self.shared.state.borrow()
    }

    pub fn is_tracking(&self) -> bool {
        self.state().tracking
    }

    pub fn loop_size(&self) -> u32 {
        self.state().loop_size
    }

    pub fn max_batch_size(&self) -> u32 {
        self.state().max_batch_size
    }

    pub fn current_loop_beat(&self) -> u32 {
        self.state().current_loop_beat
    }

    pub fn next_loop_beat(&self) -> u32 {
        self.state().next_loop_beat()
    }

    pub fn second_next_loop_beat(&self) -> u32 {
        self.state().second_next_loop_beat()
    }

    pub fn current_batch_beat(&self) -> u32 {
        self.state().current_batch_beat
    }

    pub fn next_batch_beat(&self) -> u32 {
        self.state().next_batch_beat()
    }

    pub fn current_batch_size(&self) -> u32 {
        self.state().current_batch_size
    }

    pub fn next_batch_size(&self) -> u32 {
        self.state().next_batch_size
    }

    pub fn batch_start_beat(&self) -> u32 {
        self.state().batch_start_beat
    }

    pub fn batch_end_beat(&self) -> u32 {
        self.state().batch_end_beat
    }

    pub fn next_batch_start(&self) -> u32 {
        self.state().next_batch_start
    }

    pub fn next_batch_end(&self) -> u32 {
        self.state().next_batch_end
    }
}

impl fmt::Debug for LoopTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopTracker")
            .field("state", &self.state())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Non-owning read handle to a [`LoopTracker`].
#[derive(Clone)]
pub struct TrackerView {
    shared: Weak<Shared>,
}

impl TrackerView {
    /// Current state, or `None` once the tracker has been dropped.
    pub fn state(&self) -> Option<TrackerState> {
        self.shared.upgrade().map(|shared| *shared.state.borrow())
    }
}

impl fmt::Debug for TrackerView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerView")
            .field("state", &self.state())
            .finish()
    }
}
