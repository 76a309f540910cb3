//! Cross-thread hand-off between the audio engine and the main loop.
//!
//! The engine thread is the only writer of a [`TimelineSnapshot`]; the main
//! loop is the only reader. No locks are taken on either side. Scalar fields
//! are independent atomics, so each field's latest write becomes visible on
//! its own and no ordering is promised between fields. The marker label sits
//! in a fixed inline buffer guarded by a sequence counter, which lets the
//! reader detect (and skip) a write that is still in progress.

use std::fmt;
use std::sync::atomic::{fence, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use atomic_float::{AtomicF32, AtomicF64};
use serde::{Deserialize, Serialize};

/// Longest marker label, in bytes, the snapshot keeps.
pub const MARKER_CAPACITY: usize = 128;

const MARKER_READ_ATTEMPTS: usize = 4;

/// Result codes exchanged with the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    InvalidHandle,
    InvalidParam,
    Internal(i32),
}

impl EngineStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Payload of a timeline beat notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatProperties {
    /// Beat within the current bar, starting at 1.
    pub beat: i32,
    /// Playhead position in milliseconds.
    pub position_ms: i32,
    /// Tempo in beats per minute.
    pub tempo: f32,
}

/// A notification raised by the engine on its own thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineEvent<'a> {
    Beat(BeatProperties),
    Marker(&'a str),
}

/// The engine delivered a callback whose payload could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadError {
    pub callback_type: u32,
}

/// Engine-facing callback entry point.
///
/// Writes the payload into `target` and always reports success: the engine
/// has no recovery path for a failing callback, and the next beat or marker
/// resynchronises the snapshot anyway. A payload that failed to decode is
/// dropped. A missing target (the callback fired after unregistration) is
/// ignored.
pub fn dispatch_timeline_callback(
    target: Option<&TimelineSnapshot>,
    event: std::result::Result<TimelineEvent<'_>, PayloadError>,
) -> EngineStatus {
    let (Some(snapshot), Ok(event)) = (target, event) else {
        return EngineStatus::Ok;
    };

    match event {
        TimelineEvent::Beat(properties) => snapshot.record_beat(properties),
        TimelineEvent::Marker(label) => snapshot.record_marker(label),
    }
    EngineStatus::Ok
}

/// Pinned record of the engine's latest timeline position.
///
/// Share it as an `Arc<TimelineSnapshot>`: the allocation never moves, so
/// the engine can keep writing into it for as long as it holds a clone.
pub struct TimelineSnapshot {
    current_beat: AtomicI32,
    current_position_ms: AtomicI32,
    current_position_s: AtomicF64,
    current_tempo: AtomicF32,
    marker: MarkerSlot,
}

impl TimelineSnapshot {
    pub fn new() -> Self {
        Self {
            current_beat: AtomicI32::new(0),
            current_position_ms: AtomicI32::new(0),
            current_position_s: AtomicF64::new(0.0),
            current_tempo: AtomicF32::new(0.0),
            marker: MarkerSlot::new(),
        }
    }

    /// Engine side: stores a beat notification. Does not allocate.
    pub fn record_beat(&self, properties: BeatProperties) {
        self.current_position_ms
            .store(properties.position_ms, Ordering::Relaxed);
        self.current_position_s
            .store(properties.position_ms as f64 / 1000.0, Ordering::Relaxed);
        self.current_tempo.store(properties.tempo, Ordering::Relaxed);
        // Published last so a reader that sees the new beat also sees the
        // position it should snap to.
        self.current_beat.store(properties.beat, Ordering::Release);
    }

    /// Engine side: stores the label of the marker just reached. Does not
    /// allocate; labels longer than [`MARKER_CAPACITY`] are truncated on a
    /// character boundary.
    pub fn record_marker(&self, label: &str) {
        self.marker.write(label);
    }

    pub fn current_beat(&self) -> i32 {
        self.current_beat.load(Ordering::Acquire)
    }

    pub fn current_position_ms(&self) -> i32 {
        self.current_position_ms.load(Ordering::Relaxed)
    }

    pub fn current_position_s(&self) -> f64 {
        self.current_position_s.load(Ordering::Relaxed)
    }

    pub fn current_tempo(&self) -> f32 {
        self.current_tempo.load(Ordering::Relaxed)
    }

    /// Copies the latest marker label into `out`.
    ///
    /// Returns `false`, leaving `out` untouched, when every attempt raced
    /// with a write in progress.
    pub fn read_marker(&self, out: &mut String) -> bool {
        self.marker.read_into(out)
    }

    /// Convenience wrapper around [`read_marker`](Self::read_marker).
    pub fn last_marker(&self) -> Option<String> {
        let mut label = String::new();
        self.read_marker(&mut label).then_some(label)
    }

    /// Plain copy of every field, for readouts and assertions.
    pub fn info(&self) -> TimelineInfo {
        TimelineInfo {
            current_beat: self.current_beat(),
            current_position_ms: self.current_position_ms(),
            current_position_s: self.current_position_s(),
            current_tempo: self.current_tempo(),
            last_marker: self.last_marker().unwrap_or_default(),
        }
    }
}

impl Default for TimelineSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimelineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.info(), f)
    }
}

/// Owned copy of a [`TimelineSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineInfo {
    pub current_beat: i32,
    pub current_position_ms: i32,
    pub current_position_s: f64,
    pub current_tempo: f32,
    pub last_marker: String,
}

/// Single-writer sequence-locked label buffer.
struct MarkerSlot {
    sequence: AtomicU64,
    len: AtomicUsize,
    bytes: [AtomicU8; MARKER_CAPACITY],
}

impl MarkerSlot {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            bytes: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    fn write(&self, label: &str) {
        let mut len = label.len().min(MARKER_CAPACITY);
        while !label.is_char_boundary(len) {
            len -= 1;
        }

        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        for (slot, byte) in self.bytes.iter().zip(&label.as_bytes()[..len]) {
            slot.store(*byte, Ordering::Relaxed);
        }
        self.len.store(len, Ordering::Relaxed);

        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
    }

    fn read_into(&self, out: &mut String) -> bool {
        let mut scratch = [0_u8; MARKER_CAPACITY];

        for _ in 0..MARKER_READ_ATTEMPTS {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let len = self.len.load(Ordering::Relaxed).min(MARKER_CAPACITY);
            for (byte, slot) in scratch.iter_mut().zip(&self.bytes[..len]) {
                *byte = slot.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) != before {
                continue;
            }

            if let Ok(label) = std::str::from_utf8(&scratch[..len]) {
                out.clear();
                out.push_str(label);
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;

    fn beat(beat: i32, position_ms: i32, tempo: f32) -> BeatProperties {
        BeatProperties {
            beat,
            position_ms,
            tempo,
        }
    }

    #[test]
    fn beat_callback_writes_position_and_tempo() {
        let snapshot = TimelineSnapshot::new();
        let status = dispatch_timeline_callback(
            Some(&snapshot),
            Ok(TimelineEvent::Beat(beat(3, 1_250, 96.0))),
        );

        assert!(status.is_ok());
        assert_eq!(snapshot.current_beat(), 3);
        assert_eq!(snapshot.current_position_ms(), 1_250);
        assert_relative_eq!(snapshot.current_position_s(), 1.25);
        assert_relative_eq!(snapshot.current_tempo(), 96.0);
        assert_eq!(snapshot.last_marker().as_deref(), Some(""));
    }

    #[test]
    fn marker_callback_only_touches_label() {
        let snapshot = TimelineSnapshot::new();
        dispatch_timeline_callback(Some(&snapshot), Ok(TimelineEvent::Beat(beat(2, 500, 120.0))));
        dispatch_timeline_callback(Some(&snapshot), Ok(TimelineEvent::Marker("doTrack,switchMap-b")));

        let info = snapshot.info();
        assert_eq!(info.current_beat, 2);
        assert_eq!(info.last_marker, "doTrack,switchMap-b");
    }

    #[test]
    fn undecodable_payload_is_dropped_but_reports_ok() {
        let snapshot = TimelineSnapshot::new();
        let status =
            dispatch_timeline_callback(Some(&snapshot), Err(PayloadError { callback_type: 7 }));

        assert_eq!(status, EngineStatus::Ok);
        assert_eq!(snapshot.info(), TimelineInfo::default());
    }

    #[test]
    fn missing_target_reports_ok() {
        let status = dispatch_timeline_callback(None, Ok(TimelineEvent::Marker("doTrack")));
        assert_eq!(status, EngineStatus::Ok);
    }

    #[test]
    fn long_labels_truncate_on_char_boundary() {
        let snapshot = TimelineSnapshot::new();
        let label = format!("{}é", "x".repeat(MARKER_CAPACITY - 1));
        snapshot.record_marker(&label);

        let stored = snapshot.last_marker().unwrap();
        assert_eq!(stored.len(), MARKER_CAPACITY - 1);
        assert!(stored.chars().all(|c| c == 'x'));
    }

    #[test]
    fn reader_never_observes_a_torn_label() {
        let snapshot = Arc::new(TimelineSnapshot::new());
        let done = Arc::new(AtomicBool::new(false));
        let labels = ["doTrack", "dontTrack", "switchMap-verse,doTrack"];

        std::thread::scope(|scope| {
            let writer_snapshot = Arc::clone(&snapshot);
            let writer_done = Arc::clone(&done);
            scope.spawn(move || {
                for round in 0..20_000 {
                    writer_snapshot.record_marker(labels[round % labels.len()]);
                    writer_snapshot.record_beat(beat((round % 4) as i32 + 1, round as i32, 120.0));
                }
                writer_done.store(true, Ordering::Release);
            });

            let mut label = String::new();
            while !done.load(Ordering::Acquire) {
                if snapshot.read_marker(&mut label) {
                    assert!(label.is_empty() || labels.contains(&label.as_str()), "torn read: {label}");
                }
                let current = snapshot.current_beat();
                assert!((0..=4).contains(&current));
            }
        });

        assert_eq!(snapshot.last_marker().as_deref(), Some(labels[19_999 % 3]));
    }
}
