use crate::audio::{StopMode, TrackInstance};
use crate::clock::ClockAdapter;
use crate::Result;

/// Owning system for one song: starts and stops the track instance, drives
/// the [`ClockAdapter`] once per frame and handles pausing.
///
/// Pausing saves the timeline position and resuming restores it. Without the
/// round trip the engine's timeline lags a little further behind after every
/// pause/resume cycle.
#[derive(Debug)]
pub struct MusicPlayer<T: TrackInstance> {
    adapter: ClockAdapter<T>,
    saved_position_ms: i32,
    paused: bool,
    started: bool,
    finished: bool,
    tape_stop: Option<TapeStop>,
}

/// End-of-song ramp measured on the hardware clock.
#[derive(Debug, Clone, Copy)]
struct TapeStop {
    started_at: f64,
    duration: f64,
}

impl<T: TrackInstance> MusicPlayer<T> {
    pub fn new(track: T) -> Result<Self> {
        Ok(Self {
            adapter: ClockAdapter::new(track)?,
            saved_position_ms: 0,
            paused: false,
            started: false,
            finished: false,
            tape_stop: None,
        })
    }

    /// Starts the instance and the clock. Starting a stopped instance
    /// rewinds elapsed time to zero.
    pub fn play(&mut self) -> Result<()> {
        let fresh = !self.adapter.track().is_playing();
        self.adapter.track_mut().start()?;
        if fresh {
            self.adapter.reset_clock();
        }
        self.tape_stop = None;
        self.adapter.resume();
        self.adapter.start_clock(true);
        self.started = true;
        self.finished = false;
        tracing::info!(length = self.adapter.music_length(), "song started");
        Ok(())
    }

    pub fn pause(&mut self, paused: bool) -> Result<()> {
        if paused == self.paused {
            return Ok(());
        }

        if paused {
            let track = self.adapter.track_mut();
            track.set_paused(true)?;
            self.saved_position_ms = track.timeline_position()?;
            self.adapter.stop_clock();
        } else {
            let track = self.adapter.track_mut();
            track.set_paused(false)?;
            track.set_timeline_position(self.saved_position_ms)?;
            let playing = track.is_playing();
            self.adapter.start_clock(playing);
        }

        self.paused = paused;
        tracing::debug!(paused, position_ms = self.saved_position_ms, "pause state changed");
        Ok(())
    }

    pub fn stop(&mut self, mode: StopMode) -> Result<()> {
        self.adapter.track_mut().stop(mode)?;
        self.adapter.stop_clock();
        self.started = false;
        Ok(())
    }

    /// Ends the song with a ramp of `duration` seconds. Clock processing
    /// halts at once; the instance keeps sounding until the ramp is over and
    /// is then stopped immediately.
    pub fn tape_stop(&mut self, duration: f64) {
        if !self.started || self.tape_stop.is_some() {
            return;
        }
        self.adapter.halt();
        self.tape_stop = Some(TapeStop {
            started_at: self.adapter.track().sample_clock().seconds(),
            duration: duration.max(0.0),
        });
        tracing::info!(duration, "tape stop started");
    }

    /// Ramp progress in `[0, 1]` while a tape stop is running.
    pub fn tape_stop_progress(&self) -> Option<f64> {
        let ramp = self.tape_stop?;
        if ramp.duration <= 0.0 {
            return Some(1.0);
        }
        let elapsed = self.adapter.track().sample_clock().seconds() - ramp.started_at;
        Some((elapsed / ramp.duration).clamp(0.0, 1.0))
    }

    /// Per-frame tick.
    pub fn update(&mut self) {
        self.adapter.update();

        if let Some(progress) = self.tape_stop_progress() {
            if progress >= 1.0 {
                self.tape_stop = None;
                if let Err(err) = self.stop(StopMode::Immediate) {
                    tracing::warn!(%err, "stopping track after tape stop failed");
                }
                tracing::info!("tape stop finished");
            }
            return;
        }

        if self.started && !self.finished && !self.adapter.track().is_playing() {
            self.finished = true;
            self.adapter.stop_clock();
            tracing::info!(dsp_time = self.adapter.dsp_time(), "song finished");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_playing(&self) -> bool {
        self.adapter.track().is_playing()
    }

    /// `true` once the instance stopped by itself after [`play`](Self::play).
    pub fn song_finished(&self) -> bool {
        self.finished
    }

    pub fn adapter(&self) -> &ClockAdapter<T> {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut ClockAdapter<T> {
        &mut self.adapter
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::audio::SimulatedTrack;
    use crate::tracker::LoopTracker;

    // 120 BPM at 1 kHz: one beat every 500 frames.
    fn player(length_beats: u32) -> MusicPlayer<SimulatedTrack> {
        let track = SimulatedTrack::new(120.0, 4, length_beats, 1_000).with_marker(0, "doTrack");
        MusicPlayer::new(track).unwrap()
    }

    fn run(player: &mut MusicPlayer<SimulatedTrack>, ticks: usize, frames: u64) {
        for _ in 0..ticks {
            player.adapter_mut().track_mut().advance(frames);
            player.update();
        }
    }

    #[test]
    fn elapsed_time_follows_the_song() {
        let mut player = player(32);
        player.play().unwrap();

        run(&mut player, 7, 100);
        assert_abs_diff_eq!(player.adapter().dsp_time(), 0.7, epsilon = 1e-9);

        run(&mut player, 3, 100);
        assert_abs_diff_eq!(player.adapter().dsp_time(), 1.0, epsilon = 1e-9);
        assert_eq!(player.adapter().timeline().current_beat(), 3);
    }

    #[test]
    fn pause_freezes_time_and_restores_position() {
        let mut player = player(32);
        player.play().unwrap();
        run(&mut player, 7, 100);
        let before = player.adapter().dsp_time();

        player.pause(true).unwrap();
        assert!(player.is_paused());
        assert!(!player.adapter().is_accumulating());
        run(&mut player, 50, 100);
        assert_abs_diff_eq!(player.adapter().dsp_time(), before, epsilon = 1e-9);
        assert_eq!(player.adapter().track().timeline_position().unwrap(), 700);

        player.pause(false).unwrap();
        assert!(player.adapter().is_accumulating());
        run(&mut player, 3, 100);
        assert_eq!(player.adapter().timeline().current_beat(), 3);
        assert_abs_diff_eq!(player.adapter().dsp_time(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn repeated_pause_is_idempotent() {
        let mut player = player(32);
        player.play().unwrap();
        run(&mut player, 3, 100);

        player.pause(true).unwrap();
        player.pause(true).unwrap();
        player.pause(false).unwrap();
        player.pause(false).unwrap();
        assert!(!player.is_paused());
        assert_eq!(player.adapter().track().timeline_position().unwrap(), 300);
    }

    #[test]
    fn reports_when_song_ends_on_its_own() {
        let mut player = player(4);
        player.play().unwrap();

        run(&mut player, 19, 100);
        assert!(!player.song_finished());
        assert!(player.is_playing());
        run(&mut player, 1, 100);
        assert!(player.song_finished());
        assert!(!player.is_playing());
        assert!(!player.adapter().is_accumulating());
    }

    #[test]
    fn explicit_stop_is_not_a_finish() {
        let mut player = player(4);
        player.play().unwrap();
        run(&mut player, 2, 100);

        player.stop(StopMode::AllowFadeOut).unwrap();
        run(&mut player, 1, 100);
        assert!(!player.song_finished());
    }

    #[test]
    fn tape_stop_halts_clock_then_stops_instance() {
        let mut player = player(32);
        player.play().unwrap();
        run(&mut player, 5, 100);
        let frozen = player.adapter().dsp_time();

        player.tape_stop(0.25);
        assert!(player.adapter().is_halted());
        assert_abs_diff_eq!(player.tape_stop_progress().unwrap(), 0.0);

        run(&mut player, 2, 100);
        assert!(player.is_playing());
        assert_abs_diff_eq!(player.tape_stop_progress().unwrap(), 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(player.adapter().dsp_time(), frozen);

        run(&mut player, 1, 100);
        assert!(!player.is_playing());
        assert!(player.tape_stop_progress().is_none());
        assert!(!player.song_finished());
        assert!(!player.adapter().is_accumulating());
        assert_abs_diff_eq!(player.adapter().dsp_time(), frozen);
    }

    #[test]
    fn replay_after_tape_stop_starts_from_zero() {
        let mut player = player(32);
        player.play().unwrap();
        run(&mut player, 12, 100);
        player.tape_stop(0.0);
        run(&mut player, 1, 100);
        assert!(!player.is_playing());

        player.play().unwrap();
        assert!(!player.adapter().is_halted());
        assert_eq!(player.adapter().dsp_time(), 0.0);
        // The first beat lands on the first tick and snaps time back to 0.
        run(&mut player, 3, 100);
        assert_abs_diff_eq!(player.adapter().dsp_time(), 0.2, epsilon = 1e-9);
        assert_eq!(player.adapter().timeline().current_beat(), 1);
    }

    #[test]
    fn tape_stop_before_play_is_ignored() {
        let mut player = player(32);
        player.tape_stop(1.0);
        assert!(player.tape_stop_progress().is_none());
        assert!(!player.adapter().is_halted());
    }

    #[test]
    fn trackers_follow_the_played_song() {
        let mut player = player(32);
        let tracker = LoopTracker::with_batch(player.adapter(), 8, 3);
        player.play().unwrap();

        // Beats land on frames 0, 500, ..., 4500: ten beats.
        run(&mut player, 46, 100);
        assert!(tracker.is_tracking());
        assert_eq!(tracker.current_loop_beat(), 2);
        assert_eq!(tracker.current_batch_beat(), 2);
        assert_eq!((tracker.batch_start_beat(), tracker.batch_end_beat()), (1, 3));
    }
}
