//! Core library of the beat-synchronised timing engine.
//!
//! Gameplay events in a rhythm game must land on the song's beat grid no
//! matter the frame rate. The crate reconciles the audio engine's sample
//! clock with the frame-driven main loop:
//!
//! - [`timeline`] is the lock-free hand-off the engine's render thread writes
//!   beat and marker notifications into.
//! - [`clock::ClockAdapter`] polls that hand-off once per frame, publishes
//!   beat/tempo/marker edges, keeps drift-corrected song time and fires the
//!   eighth/sixteenth/thirty-second subdivision cascade.
//! - [`tracker::LoopTracker`] folds the beat stream into a repeating loop
//!   split into batches, with lookahead for consumers that render ahead.
//! - [`player::MusicPlayer`] owns a song and handles play, pause and stop.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod player;
pub mod timeline;
pub mod tracker;

pub use audio::{PlaybackState, SampleClock, SimulatedTrack, StopMode, TrackDescription, TrackInstance};
pub use clock::{ClockAdapter, ClockEvents, ClockReadout, Subdivision};
pub use config::{AppConfig, AudioConfig, MarkerConfig, SongConfig, TrackerConfig};
pub use error::{BeatSyncError, Result};
pub use events::{Event, Subscription};
pub use player::MusicPlayer;
pub use timeline::{BeatProperties, EngineStatus, TimelineEvent, TimelineInfo, TimelineSnapshot};
pub use tracker::{LoopTracker, TrackerEvents, TrackerState, TrackerView};
