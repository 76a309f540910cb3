use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BeatSyncError, Result};

/// Top-level configuration structure for a timing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub song: SongConfig,
    pub trackers: Vec<TrackerConfig>,
    /// Rate at which the main loop polls the clock, in frames per second.
    pub frame_rate: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            song: SongConfig::default(),
            trackers: vec![
                TrackerConfig::new("gameplay", 16, None),
                TrackerConfig::new("ui", 16, Some(4)),
            ],
            frame_rate: 60,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects values that can never drive a session. A batch size larger
    /// than its loop is accepted; the tracker clamps it.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(BeatSyncError::InvalidConfig("sample rate must be non-zero"));
        }
        if self.frame_rate == 0 {
            return Err(BeatSyncError::InvalidConfig("frame rate must be non-zero"));
        }
        self.song.validate()?;
        for tracker in &self.trackers {
            tracker.validate()?;
        }
        Ok(())
    }

    /// Number of engine frames that elapse between two main-loop ticks.
    pub fn frames_per_tick(&self) -> u64 {
        (self.audio.sample_rate / self.frame_rate.max(1)).max(1) as u64
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { sample_rate: 48_000 }
    }
}

/// Shape of the song played by the simulated backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SongConfig {
    pub tempo_bpm: f32,
    pub beats_per_bar: u32,
    pub length_beats: u32,
    pub markers: Vec<MarkerConfig>,
}

impl Default for SongConfig {
    fn default() -> Self {
        Self {
            tempo_bpm: 120.0,
            beats_per_bar: 4,
            length_beats: 64,
            markers: vec![
                MarkerConfig::new(0, "dontTrack"),
                MarkerConfig::new(4, "doTrack"),
                MarkerConfig::new(36, "switchMap-chorus"),
                MarkerConfig::new(52, "dontTrack"),
            ],
        }
    }
}

impl SongConfig {
    fn validate(&self) -> Result<()> {
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm > 0.0) {
            return Err(BeatSyncError::InvalidConfig("tempo must be a positive number"));
        }
        if self.beats_per_bar == 0 {
            return Err(BeatSyncError::InvalidConfig("beats per bar must be non-zero"));
        }
        if self.length_beats == 0 {
            return Err(BeatSyncError::InvalidConfig("song length must be non-zero"));
        }
        Ok(())
    }
}

/// A timeline marker placed on a beat boundary. Beat indices are 0-based
/// offsets from the start of the song; the label may pack several
/// comma-separated tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub beat: u32,
    pub label: String,
}

impl MarkerConfig {
    pub fn new(beat: u32, label: impl Into<String>) -> Self {
        Self {
            beat,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub name: String,
    pub loop_size: u32,
    /// `None` tracks the whole loop as a single batch.
    #[serde(default)]
    pub max_batch_size: Option<u32>,
}

impl TrackerConfig {
    pub fn new(name: impl Into<String>, loop_size: u32, max_batch_size: Option<u32>) -> Self {
        Self {
            name: name.into(),
            loop_size,
            max_batch_size,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.loop_size == 0 {
            return Err(BeatSyncError::InvalidConfig("loop size must be non-zero"));
        }
        if self.max_batch_size == Some(0) {
            return Err(BeatSyncError::InvalidConfig("batch size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frames_per_tick(), 800);
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = AppConfig::from_json_str(
            r#"{ "song": { "tempo_bpm": 90.0 }, "trackers": [{ "name": "solo", "loop_size": 8 }] }"#,
        )
        .unwrap();

        assert_eq!(config.song.tempo_bpm, 90.0);
        assert_eq!(config.song.beats_per_bar, 4);
        assert_eq!(config.trackers.len(), 1);
        assert_eq!(config.trackers[0].max_batch_size, None);
        assert_eq!(config.audio.sample_rate, 48_000);
    }

    #[test]
    fn audio_section_needs_only_a_sample_rate() {
        let config = AppConfig::from_json_str(r#"{ "audio": { "sample_rate": 1000 } }"#).unwrap();
        assert_eq!(config.audio.sample_rate, 1_000);
        assert_eq!(config.frames_per_tick(), 16);

        let config = AppConfig::from_json_str(r#"{ "audio": {} }"#).unwrap();
        assert_eq!(config.audio.sample_rate, 48_000);
    }

    #[test]
    fn rejects_zero_loop_size() {
        let err = AppConfig::from_json_str(r#"{ "trackers": [{ "name": "bad", "loop_size": 0 }] }"#)
            .unwrap_err();
        assert!(matches!(err, BeatSyncError::InvalidConfig(_)));
    }

    #[test]
    fn accepts_batch_larger_than_loop() {
        let config = AppConfig::from_json_str(
            r#"{ "trackers": [{ "name": "wide", "loop_size": 4, "max_batch_size": 9 }] }"#,
        )
        .unwrap();
        assert_eq!(config.trackers[0].max_batch_size, Some(9));
    }

    #[test]
    fn rejects_non_positive_tempo() {
        let mut config = AppConfig::default();
        config.song.tempo_bpm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_markers() {
        let config = AppConfig::default();
        let json = config.to_json_pretty().unwrap();
        let parsed = AppConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.song.markers.len(), config.song.markers.len());
        assert_eq!(parsed.song.markers[1].label, "doTrack");
    }
}
