//! Drift-corrected song clock.
//!
//! [`ClockAdapter`] owns one playing track instance and is polled once per
//! main-loop frame. It turns the engine's asynchronous beat/marker snapshot
//! into edge-triggered events and keeps an elapsed-time value that follows
//! the hardware sample clock between beats and snaps to the engine's own
//! position on every beat.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::audio::{StopMode, TrackInstance};
use crate::events::Event;
use crate::timeline::TimelineSnapshot;
use crate::Result;

/// Separator for markers packed with several labels.
pub const MARKER_DELIMITER: char = ',';

/// Rhythmic subdivisions finer than a beat, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Subdivision {
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl Subdivision {
    pub const ALL: [Subdivision; 3] = [Self::Eighth, Self::Sixteenth, Self::ThirtySecond];

    fn index(self) -> usize {
        match self {
            Self::Eighth => 0,
            Self::Sixteenth => 1,
            Self::ThirtySecond => 2,
        }
    }
}

/// Interval lengths and firing state for the subdivision cascade.
///
/// A subdivision that fires forces every finer one to fire on the same
/// tick, which keeps the finer grids phase-locked to the coarser ones.
#[derive(Debug, Clone, PartialEq)]
pub struct SubdivisionTimers {
    length_4th: f64,
    lengths: [f64; 3],
    timers: [f64; 3],
    pending: [bool; 3],
}

impl SubdivisionTimers {
    /// Every subdivision starts out pending so the first tick fires all.
    pub fn new() -> Self {
        Self {
            length_4th: f64::INFINITY,
            lengths: [f64::INFINITY; 3],
            timers: [0.0; 3],
            pending: [true; 3],
        }
    }

    /// Derives interval lengths, in seconds, from `tempo` in BPM. A
    /// non-positive tempo yields infinite intervals.
    pub fn recompute(&mut self, tempo: f32) {
        self.length_4th = if tempo > 0.0 {
            60.0 / tempo as f64
        } else {
            f64::INFINITY
        };
        let mut length = self.length_4th;
        for slot in &mut self.lengths {
            length /= 2.0;
            *slot = length;
        }
    }

    /// Marks every subdivision to fire on the next cascade.
    pub fn force_all(&mut self) {
        self.pending = [true; 3];
    }

    pub fn is_pending(&self, subdivision: Subdivision) -> bool {
        self.pending[subdivision.index()]
    }

    pub fn length_4th(&self) -> f64 {
        self.length_4th
    }

    pub fn length(&self, subdivision: Subdivision) -> f64 {
        self.lengths[subdivision.index()]
    }

    /// Fires pending subdivisions coarsest first and returns which fired.
    pub fn cascade(&mut self) -> [bool; 3] {
        let mut fired = [false; 3];
        for index in 0..self.pending.len() {
            if !self.pending[index] {
                continue;
            }
            fired[index] = true;
            self.pending[index] = false;
            self.timers[index] = 0.0;
            for finer in &mut self.pending[index + 1..] {
                *finer = true;
            }
        }
        fired
    }

    /// Advances every timer by `delta` seconds and schedules the coarsest
    /// elapsed subdivision (and all finer ones) for the next tick.
    pub fn advance(&mut self, delta: f64) {
        for timer in &mut self.timers {
            *timer += delta;
        }
        if let Some(index) = (0..self.timers.len()).find(|&i| self.timers[i] >= self.lengths[i]) {
            for pending in &mut self.pending[index..] {
                *pending = true;
            }
        }
    }
}

impl Default for SubdivisionTimers {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications published by a [`ClockAdapter`]. All of them fire from
/// [`ClockAdapter::update`], on the thread that polls the adapter.
#[derive(Debug, Default)]
pub struct ClockEvents {
    pub beat_updated: Event<()>,
    pub tempo_updated: Event<()>,
    /// Fired once per label, in order, when the marker changes.
    pub marker_updated: Event<str>,
    pub eighth_note: Event<()>,
    pub sixteenth_note: Event<()>,
    pub thirtysecond_note: Event<()>,
}

impl ClockEvents {
    pub fn subdivision(&self, subdivision: Subdivision) -> &Event<()> {
        match subdivision {
            Subdivision::Eighth => &self.eighth_note,
            Subdivision::Sixteenth => &self.sixteenth_note,
            Subdivision::ThirtySecond => &self.thirtysecond_note,
        }
    }
}

/// Adapter between one track instance of the audio engine and the main loop.
pub struct ClockAdapter<T: TrackInstance> {
    track: T,
    timeline: Arc<TimelineSnapshot>,
    events: ClockEvents,
    music_length: f32,

    last_beat: i32,
    last_tempo: f32,
    last_marker: String,
    marker_scratch: String,

    raw_last_time: f64,
    raw_current_time: f64,
    dsp_delta_time: f64,
    dsp_time: f64,
    accumulate: bool,
    halted: bool,

    subdivisions: SubdivisionTimers,
}

impl<T: TrackInstance> ClockAdapter<T> {
    /// Takes ownership of `track` and registers the timeline callback.
    ///
    /// Elapsed time does not accumulate until [`start_clock`](Self::start_clock)
    /// is called with a playing instance.
    pub fn new(mut track: T) -> Result<Self> {
        let description = track.description()?;
        let timeline = Arc::new(TimelineSnapshot::new());

        let status = track.set_timeline_callback(Some(Arc::clone(&timeline)));
        if !status.is_ok() {
            tracing::error!(?status, "audio engine refused the timeline callback");
        }
        debug_assert!(status.is_ok(), "timeline callback registration failed: {status:?}");

        let raw_time = track.sample_clock().seconds();
        tracing::debug!(length_ms = description.length_ms, "clock adapter attached");

        Ok(Self {
            track,
            timeline,
            events: ClockEvents::default(),
            music_length: description.length_ms as f32 / 1000.0,
            last_beat: 0,
            last_tempo: 0.0,
            last_marker: String::new(),
            marker_scratch: String::with_capacity(crate::timeline::MARKER_CAPACITY),
            raw_last_time: raw_time,
            raw_current_time: raw_time,
            dsp_delta_time: 0.0,
            dsp_time: 0.0,
            accumulate: false,
            halted: false,
            subdivisions: SubdivisionTimers::new(),
        })
    }

    /// Per-frame tick: advances elapsed time, publishes tempo, marker and
    /// beat edges, then runs the subdivision cascade.
    pub fn update(&mut self) {
        if self.halted {
            return;
        }

        self.update_dsp_time();

        let tempo = self.timeline.current_tempo();
        if tempo != self.last_tempo {
            self.last_tempo = tempo;
            tracing::trace!(tempo, "tempo updated");
            self.events.tempo_updated.fire();
        }

        if self.timeline.read_marker(&mut self.marker_scratch)
            && self.marker_scratch != self.last_marker
        {
            std::mem::swap(&mut self.last_marker, &mut self.marker_scratch);
            for label in self
                .last_marker
                .split(MARKER_DELIMITER)
                .map(str::trim)
                .filter(|label| !label.is_empty())
            {
                tracing::trace!(label, "marker updated");
                self.events.marker_updated.emit(label);
            }
        }

        let beat = self.timeline.current_beat();
        if beat != self.last_beat {
            self.last_beat = beat;
            tracing::trace!(beat, "beat updated");
            self.events.beat_updated.fire();

            self.correct_dsp_time();
            self.subdivisions.force_all();
        }

        self.subdivisions.recompute(tempo);
        let fired = self.subdivisions.cascade();
        for subdivision in Subdivision::ALL {
            if fired[subdivision.index()] {
                self.events.subdivision(subdivision).fire();
            }
        }
        self.subdivisions.advance(self.dsp_delta_time);
    }

    /// Re-enables elapsed-time accumulation, but only when the instance is
    /// actually playing.
    pub fn start_clock(&mut self, instance_already_playing: bool) {
        if !instance_already_playing {
            tracing::debug!("clock start ignored: instance is not playing");
            return;
        }
        self.accumulate = true;
        self.track.set_clock_paused(false);
        tracing::debug!(dsp_time = self.dsp_time, "clock started");
    }

    /// Stops elapsed-time accumulation and pauses the hardware clock
    /// reference. Beat and marker state is left untouched.
    pub fn stop_clock(&mut self) {
        self.accumulate = false;
        self.track.set_clock_paused(true);
        tracing::debug!(dsp_time = self.dsp_time, "clock stopped");
    }

    pub fn reset_clock(&mut self) {
        self.dsp_time = 0.0;
    }

    /// Stops all further per-tick processing. Only meant for an instance
    /// that is about to end.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Undoes [`halt`](Self::halt) for a freshly restarted instance. Time
    /// spent halted is not counted.
    pub fn resume(&mut self) {
        if !self.halted {
            return;
        }
        self.halted = false;
        self.raw_current_time = self.track.sample_clock().seconds();
        self.raw_last_time = self.raw_current_time;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulate
    }

    pub fn events(&self) -> &ClockEvents {
        &self.events
    }

    /// Shared read handle to the snapshot the engine writes into.
    pub fn timeline(&self) -> &Arc<TimelineSnapshot> {
        &self.timeline
    }

    pub fn track(&self) -> &T {
        &self.track
    }

    pub fn track_mut(&mut self) -> &mut T {
        &mut self.track
    }

    /// Elapsed song time in seconds.
    pub fn dsp_time(&self) -> f64 {
        self.dsp_time
    }

    /// Hardware clock time that passed during the last tick, in seconds.
    pub fn dsp_delta_time(&self) -> f64 {
        self.dsp_delta_time
    }

    pub fn length_4th(&self) -> f64 {
        self.subdivisions.length_4th()
    }

    pub fn length_8th(&self) -> f64 {
        self.subdivisions.length(Subdivision::Eighth)
    }

    pub fn length_16th(&self) -> f64 {
        self.subdivisions.length(Subdivision::Sixteenth)
    }

    pub fn length_32nd(&self) -> f64 {
        self.subdivisions.length(Subdivision::ThirtySecond)
    }

    /// Track length in seconds.
    pub fn music_length(&self) -> f32 {
        self.music_length
    }

    pub fn readout(&self) -> ClockReadout {
        let info = self.timeline.info();
        ClockReadout {
            current_beat: info.current_beat,
            last_marker: info.last_marker,
            current_position_ms: info.current_position_ms,
            current_tempo: info.current_tempo,
            dsp_time: self.dsp_time,
            music_length: self.music_length,
        }
    }

    fn update_dsp_time(&mut self) {
        self.raw_last_time = self.raw_current_time;
        self.raw_current_time = self.track.sample_clock().seconds();
        self.dsp_delta_time = (self.raw_current_time - self.raw_last_time).max(0.0);

        if self.accumulate {
            self.dsp_time += self.dsp_delta_time;
        }
    }

    // Frame-granular sampling drifts; the engine's position at a beat
    // boundary does not.
    fn correct_dsp_time(&mut self) {
        self.dsp_time = self.timeline.current_position_s();
    }
}

impl<T: TrackInstance> Drop for ClockAdapter<T> {
    fn drop(&mut self) {
        // The callback must be gone before the instance is released.
        let _ = self.track.set_timeline_callback(None);
        if let Err(err) = self.track.stop(StopMode::Immediate) {
            tracing::debug!(%err, "stopping track instance on teardown failed");
        }
        self.track.release();
    }
}

impl<T: TrackInstance> fmt::Debug for ClockAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockAdapter")
            .field("timeline", &self.timeline)
            .field("dsp_time", &self.dsp_time)
            .field("accumulate", &self.accumulate)
            .field("halted", &self.halted)
            .field("music_length", &self.music_length)
            .finish()
    }
}

/// Debug readout of a [`ClockAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockReadout {
    pub current_beat: i32,
    pub last_marker: String,
    pub current_position_ms: i32,
    pub current_tempo: f32,
    pub dsp_time: f64,
    pub music_length: f32,
}

impl fmt::Display for ClockReadout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Current beat = {}, Last marker = {}",
            self.current_beat, self.last_marker
        )?;
        writeln!(
            f,
            "Current position = {}, Current BPM = {}",
            self.current_position_ms, self.current_tempo
        )?;
        writeln!(f, "Current time = {:.10}", self.dsp_time)?;
        write!(f, "Song length = {} seconds", self.music_length)
    }
}
