use std::sync::Arc;

use crate::config::{MarkerConfig, SongConfig};
use crate::timeline::{dispatch_timeline_callback, BeatProperties, EngineStatus, TimelineEvent, TimelineSnapshot};
use crate::{BeatSyncError, Result};

/// Playback state reported by a track instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Starting,
    Stopping,
    Stopped,
}

/// How a track instance should come to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    #[default]
    Immediate,
    AllowFadeOut,
}

/// Reading of the engine's free-running hardware sample clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleClock {
    pub samples: u64,
    pub sample_rate: u32,
}

impl SampleClock {
    /// Clock position in seconds. A zero sample rate reads as zero.
    pub fn seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples as f64 / self.sample_rate as f64
    }
}

/// Static information about the track an instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDescription {
    pub length_ms: i32,
}

/// Capabilities the timing engine needs from one playing track of the
/// audio backend.
///
/// Implementations deliver timeline notifications by calling
/// [`dispatch_timeline_callback`] with the registered snapshot, from
/// whichever thread the backend renders on.
pub trait TrackInstance {
    fn description(&self) -> Result<TrackDescription>;

    /// Registers (`Some`) or clears (`None`) the snapshot that beat and
    /// marker notifications are written into.
    fn set_timeline_callback(&mut self, target: Option<Arc<TimelineSnapshot>>) -> EngineStatus;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self, mode: StopMode) -> Result<()>;

    fn set_paused(&mut self, paused: bool) -> Result<()>;

    fn playback_state(&self) -> PlaybackState;

    /// Timeline position in milliseconds.
    fn timeline_position(&self) -> Result<i32>;

    fn set_timeline_position(&mut self, position_ms: i32) -> Result<()>;

    fn sample_clock(&self) -> SampleClock;

    /// Pauses or resumes the hardware clock reference.
    fn set_clock_paused(&mut self, paused: bool);

    /// Stops the instance and frees its backend resources. Further calls
    /// may fail.
    fn release(&mut self);

    fn is_playing(&self) -> bool {
        self.playback_state() != PlaybackState::Stopped
    }
}

/// Deterministic in-process backend.
///
/// Time only moves when [`advance`](Self::advance) is called. For every beat
/// boundary crossed, the markers placed on that beat are reported first and
/// the beat itself second.
#[derive(Debug)]
pub struct SimulatedTrack {
    sample_rate: u32,
    tempo: f32,
    beats_per_bar: u32,
    length_beats: u32,
    markers: Vec<MarkerConfig>,
    marker_cursor: usize,
    callback: Option<Arc<TimelineSnapshot>>,
    registration_status: EngineStatus,
    state: PlaybackState,
    paused: bool,
    clock_paused: bool,
    released: bool,
    clock_samples: u64,
    position: u64,
    next_beat: u32,
    next_beat_at: f64,
    last_beat_at: f64,
}

impl SimulatedTrack {
    pub fn new(tempo: f32, beats_per_bar: u32, length_beats: u32, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            tempo,
            beats_per_bar: beats_per_bar.max(1),
            length_beats,
            markers: Vec::new(),
            marker_cursor: 0,
            callback: None,
            registration_status: EngineStatus::Ok,
            state: PlaybackState::Stopped,
            paused: false,
            clock_paused: false,
            released: false,
            clock_samples: 0,
            position: 0,
            next_beat: 0,
            next_beat_at: 0.0,
            last_beat_at: 0.0,
        }
    }

    pub fn from_config(song: &SongConfig, sample_rate: u32) -> Self {
        song.markers
            .iter()
            .fold(
                Self::new(song.tempo_bpm, song.beats_per_bar, song.length_beats, sample_rate),
                |track, marker| track.with_marker(marker.beat, marker.label.clone()),
            )
    }

    /// Places a marker on the 0-based song beat `beat`.
    pub fn with_marker(mut self, beat: u32, label: impl Into<String>) -> Self {
        self.markers.push(MarkerConfig::new(beat, label));
        self.markers.sort_by_key(|marker| marker.beat);
        self
    }

    /// Makes callback registration report `status`, as a misbehaving
    /// backend would.
    pub fn with_registration_status(mut self, status: EngineStatus) -> Self {
        self.registration_status = status;
        self
    }

    /// Changes the tempo from the next beat boundary onwards. The next beat
    /// is rescheduled one new beat length after the last reported one, or
    /// after the current position when the grid was frozen by a zero tempo.
    pub fn set_tempo(&mut self, tempo: f32) {
        let previous = self.samples_per_beat();
        self.tempo = tempo;
        if self.next_beat == 0 {
            return;
        }
        if !previous.is_finite() {
            self.last_beat_at = self.position as f64;
        }
        self.next_beat_at = (self.last_beat_at + self.samples_per_beat()).max(self.position as f64);
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_clock_paused(&self) -> bool {
        self.clock_paused
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Advances the hardware clock by `frames` and, while playing, the
    /// timeline as well.
    pub fn advance(&mut self, frames: u64) {
        if self.released {
            return;
        }
        if !self.clock_paused {
            self.clock_samples += frames;
        }
        if self.state != PlaybackState::Playing || self.paused {
            return;
        }

        self.position += frames;
        while self.next_beat < self.length_beats && self.position as f64 >= self.next_beat_at {
            self.emit_beat();
        }
        if self.next_beat >= self.length_beats && self.position as f64 >= self.next_beat_at {
            self.state = PlaybackState::Stopped;
        }
    }

    fn emit_beat(&mut self) {
        let beat = self.next_beat;
        let target = self.callback.as_deref();

        while let Some(marker) = self.markers.get(self.marker_cursor) {
            if marker.beat > beat {
                break;
            }
            if marker.beat == beat {
                dispatch_timeline_callback(target, Ok(TimelineEvent::Marker(&marker.label)));
            }
            self.marker_cursor += 1;
        }

        let properties = BeatProperties {
            beat: (beat % self.beats_per_bar) as i32 + 1,
            position_ms: self.samples_to_ms(self.next_beat_at),
            tempo: self.tempo,
        };
        dispatch_timeline_callback(target, Ok(TimelineEvent::Beat(properties)));

        self.next_beat += 1;
        self.last_beat_at = self.next_beat_at;
        self.next_beat_at += self.samples_per_beat();
    }

    fn samples_per_beat(&self) -> f64 {
        if self.tempo <= 0.0 {
            return f64::INFINITY;
        }
        self.sample_rate as f64 * 60.0 / self.tempo as f64
    }

    fn samples_to_ms(&self, samples: f64) -> i32 {
        if self.sample_rate == 0 {
            return 0;
        }
        (samples * 1000.0 / self.sample_rate as f64) as i32
    }

    fn seek_samples(&mut self, position: u64) {
        let per_beat = self.samples_per_beat();
        self.position = position;
        if per_beat.is_finite() {
            self.next_beat = ((position as f64 / per_beat).ceil() as u32).min(self.length_beats);
            self.next_beat_at = self.next_beat as f64 * per_beat;
            self.last_beat_at = self.next_beat.saturating_sub(1) as f64 * per_beat;
        } else {
            // Without a tempo the grid cannot be placed; the next beat is
            // reported as soon as playback moves.
            self.next_beat = self.next_beat.min(self.length_beats);
            self.next_beat_at = position as f64;
            self.last_beat_at = position as f64;
        }
        self.marker_cursor = self
            .markers
            .partition_point(|marker| marker.beat < self.next_beat);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(BeatSyncError::engine("track instance has been released"));
        }
        Ok(())
    }
}

impl TrackInstance for SimulatedTrack {
    fn description(&self) -> Result<TrackDescription> {
        self.ensure_live()?;
        let length_samples = self.samples_per_beat() * self.length_beats as f64;
        Ok(TrackDescription {
            length_ms: self.samples_to_ms(length_samples),
        })
    }

    fn set_timeline_callback(&mut self, target: Option<Arc<TimelineSnapshot>>) -> EngineStatus {
        if self.released {
            return EngineStatus::InvalidHandle;
        }
        if target.is_some() && !self.registration_status.is_ok() {
            return self.registration_status;
        }
        self.callback = target;
        EngineStatus::Ok
    }

    fn start(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.state == PlaybackState::Stopped {
            self.seek_samples(0);
        }
        self.state = PlaybackState::Playing;
        Ok(())
    }

    fn stop(&mut self, _mode: StopMode) -> Result<()> {
        self.ensure_live()?;
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.ensure_live()?;
        self.paused = paused;
        Ok(())
    }

    fn playback_state(&self) -> PlaybackState {
        self.state
    }

    fn timeline_position(&self) -> Result<i32> {
        self.ensure_live()?;
        Ok(self.samples_to_ms(self.position as f64))
    }

    fn set_timeline_position(&mut self, position_ms: i32) -> Result<()> {
        self.ensure_live()?;
        if position_ms < 0 {
            return Err(BeatSyncError::engine("timeline position must not be negative"));
        }
        let samples = position_ms as u64 * self.sample_rate as u64 / 1000;
        self.seek_samples(samples);
        Ok(())
    }

    fn sample_clock(&self) -> SampleClock {
        SampleClock {
            samples: self.clock_samples,
            sample_rate: self.sample_rate,
        }
    }

    fn set_clock_paused(&mut self, paused: bool) {
        self.clock_paused = paused;
    }

    fn release(&mut self) {
        self.state = PlaybackState::Stopped;
        self.callback = None;
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing_track(tempo: f32) -> (SimulatedTrack, Arc<TimelineSnapshot>) {
        let snapshot = Arc::new(TimelineSnapshot::new());
        let mut track = SimulatedTrack::new(tempo, 4, 8, 1_000);
        assert!(track.set_timeline_callback(Some(Arc::clone(&snapshot))).is_ok());
        track.start().unwrap();
        (track, snapshot)
    }

    #[test]
    fn reports_first_beat_at_position_zero() {
        let (mut track, snapshot) = playing_track(120.0);
        track.advance(0);

        assert_eq!(snapshot.current_beat(), 1);
        assert_eq!(snapshot.current_position_ms(), 0);
        assert_eq!(snapshot.current_tempo(), 120.0);
    }

    #[test]
    fn beats_wrap_within_the_bar() {
        let (mut track, snapshot) = playing_track(120.0);
        // 500 frames per beat at 1 kHz and 120 BPM.
        track.advance(0);
        track.advance(500 * 4);

        assert_eq!(snapshot.current_beat(), 1);
        assert_eq!(snapshot.current_position_ms(), 2_000);
    }

    #[test]
    fn markers_are_reported_before_their_beat() {
        let snapshot = Arc::new(TimelineSnapshot::new());
        let mut track = SimulatedTrack::new(60.0, 4, 8, 1_000).with_marker(2, "doTrack");
        track.set_timeline_callback(Some(Arc::clone(&snapshot)));
        track.start().unwrap();

        track.advance(1_000);
        assert_eq!(snapshot.last_marker().as_deref(), Some(""));
        track.advance(1_000);
        assert_eq!(snapshot.last_marker().as_deref(), Some("doTrack"));
        assert_eq!(snapshot.current_beat(), 3);
    }

    #[test]
    fn clock_runs_while_stopped_but_not_while_paused() {
        let mut track = SimulatedTrack::new(120.0, 4, 8, 1_000);
        track.advance(250);
        assert_eq!(track.sample_clock().samples, 250);

        track.set_clock_paused(true);
        track.advance(250);
        assert_eq!(track.sample_clock().samples, 250);
        assert_eq!(track.timeline_position().unwrap(), 0);
    }

    #[test]
    fn stops_at_end_of_song() {
        let (mut track, snapshot) = playing_track(120.0);
        track.advance(500 * 8);

        assert_eq!(track.playback_state(), PlaybackState::Stopped);
        assert_eq!(snapshot.current_beat(), 4);
        assert_eq!(track.description().unwrap().length_ms, 4_000);
    }

    #[test]
    fn seeking_resumes_from_the_next_boundary() {
        let (mut track, snapshot) = playing_track(120.0);
        track.advance(1_200);
        assert_eq!(snapshot.current_beat(), 3);

        track.set_timeline_position(1_200).unwrap();
        track.advance(299);
        assert_eq!(snapshot.current_beat(), 3);
        track.advance(1);
        assert_eq!(snapshot.current_beat(), 4);
    }

    #[test]
    fn tempo_change_reschedules_the_next_beat() {
        let (mut track, snapshot) = playing_track(120.0);
        track.advance(600);
        assert_eq!(snapshot.current_position_ms(), 500);

        track.set_tempo(60.0);
        track.advance(899);
        assert_eq!(snapshot.current_beat(), 2);
        track.advance(1);
        assert_eq!(snapshot.current_beat(), 3);
        assert_eq!(snapshot.current_position_ms(), 1_500);
        assert_eq!(snapshot.current_tempo(), 60.0);
    }

    #[test]
    fn track_starting_without_tempo_recovers_once_tempo_is_set() {
        let (mut track, snapshot) = playing_track(0.0);
        track.set_tempo(120.0);
        track.advance(2_000);

        assert_eq!(snapshot.current_beat(), 1);
        assert_eq!(snapshot.current_position_ms(), 2_000);
        assert_eq!(snapshot.current_tempo(), 120.0);
    }

    #[test]
    fn zero_tempo_mid_song_holds_the_grid_until_tempo_returns() {
        let (mut track, snapshot) = playing_track(120.0);
        track.advance(500);
        track.set_tempo(0.0);
        track.advance(5_000);
        assert_eq!(snapshot.current_beat(), 2);

        track.set_tempo(120.0);
        track.advance(499);
        assert_eq!(snapshot.current_beat(), 2);
        track.advance(1);
        assert_eq!(snapshot.current_beat(), 3);
        assert_eq!(snapshot.current_position_ms(), 6_000);
        assert_eq!(snapshot.current_tempo(), 120.0);
    }

    #[test]
    fn refused_registration_leaves_callback_unset() {
        let mut track = SimulatedTrack::new(120.0, 4, 8, 1_000)
            .with_registration_status(EngineStatus::Internal(28));
        let status = track.set_timeline_callback(Some(Arc::new(TimelineSnapshot::new())));

        assert_eq!(status, EngineStatus::Internal(28));
        assert!(!track.has_callback());
    }

    #[test]
    fn released_track_rejects_calls() {
        let (mut track, _) = playing_track(120.0);
        track.release();

        assert!(track.start().is_err());
        assert!(!track.has_callback());
        assert!(!track.is_playing());
    }
}
