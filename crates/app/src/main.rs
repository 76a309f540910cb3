use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use beat_sync_core::{
    AppConfig, LoopTracker, MusicPlayer, SimulatedTrack, Subdivision, Subscription, TrackerConfig,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Largest loop the `layout` command will play through.
const MAX_LAYOUT_LOOP: u32 = 1 << 16;

fn main() -> beat_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            seconds,
            pause_at,
            resume_at,
        } => run_simulate(config.as_ref(), seconds, pause_at, resume_at),
        Commands::Layout { loop_size, batch } => run_layout(loop_size, batch),
        Commands::DumpConfig => {
            println!("{}", AppConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn run_simulate(
    config_path: Option<&PathBuf>,
    seconds: f32,
    pause_at: Option<f32>,
    resume_at: Option<f32>,
) -> beat_sync_core::Result<()> {
    let config = match config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    tracing::info!(?config_path, trackers = config.trackers.len(), "starting simulation");

    let track = SimulatedTrack::from_config(&config.song, config.audio.sample_rate);
    let mut player = MusicPlayer::new(track)?;
    let mut subscriptions = Vec::new();

    let eighths = Rc::new(Cell::new(0_u64));
    {
        let events = player.adapter().events();
        let counter = Rc::clone(&eighths);
        subscriptions.push(
            events
                .subdivision(Subdivision::Eighth)
                .subscribe(move |_| counter.set(counter.get() + 1)),
        );
        let timeline = std::sync::Arc::clone(player.adapter().timeline());
        subscriptions.push(events.tempo_updated.subscribe(move |_| {
            tracing::info!(tempo = timeline.current_tempo(), "tempo updated");
        }));
    }

    let trackers: Vec<(String, LoopTracker)> = config
        .trackers
        .iter()
        .map(|tracker| (tracker.name.clone(), build_tracker(&player, tracker)))
        .collect();
    for (name, tracker) in &trackers {
        subscriptions.extend(log_tracker(name, tracker));
    }

    let frames = config.frames_per_tick();
    let to_tick = |at: f32| (at.max(0.0) * config.frame_rate as f32) as u64;
    let pause_tick = pause_at.map(to_tick);
    let resume_tick = resume_at.map(to_tick);
    let total_ticks = to_tick(seconds);

    player.play()?;
    for tick in 0..total_ticks {
        if pause_tick == Some(tick) {
            player.pause(true)?;
        }
        if resume_tick == Some(tick) {
            player.pause(false)?;
        }

        player.adapter_mut().track_mut().advance(frames);
        player.update();

        if player.song_finished() {
            tracing::info!(tick, "song reached its end");
            break;
        }
    }

    tracing::info!(eighth_notes = eighths.get(), "simulation finished");
    println!("{}", player.adapter().readout());
    for (name, tracker) in &trackers {
        println!("{name}: {}", serde_json::to_string(&tracker.state())?);
    }
    Ok(())
}

fn build_tracker(player: &MusicPlayer<SimulatedTrack>, config: &TrackerConfig) -> LoopTracker {
    let batch = config.max_batch_size.unwrap_or(config.loop_size);
    LoopTracker::with_batch(player.adapter(), config.loop_size, batch)
}

fn log_tracker(name: &str, tracker: &LoopTracker) -> Vec<Subscription> {
    let events = tracker.events();
    let mut subscriptions = Vec::new();

    let label = name.to_string();
    subscriptions.push(events.loop_start.subscribe(move |_| {
        tracing::info!(tracker = %label, "loop start");
    }));

    let label = name.to_string();
    let view = tracker.view();
    subscriptions.push(events.batch_start.subscribe(move |_| {
        if let Some(state) = view.state() {
            tracing::debug!(
                tracker = %label,
                start = state.batch_start_beat,
                end = state.batch_end_beat,
                next_start = state.next_batch_start,
                next_end = state.next_batch_end,
                "batch start"
            );
        }
    }));

    let label = name.to_string();
    subscriptions.push(events.do_track.subscribe(move |_| {
        tracing::info!(tracker = %label, "tracking enabled");
    }));

    let label = name.to_string();
    subscriptions.push(events.dont_track.subscribe(move |_| {
        tracing::info!(tracker = %label, "tracking disabled");
    }));

    let label = name.to_string();
    subscriptions.push(events.switch_map.subscribe(move |map: &str| {
        tracing::info!(tracker = %label, map, "switch map");
    }));

    subscriptions
}

/// Plays a loop twice through a simulated song and prints every batch.
fn run_layout(loop_size: u32, batch: Option<u32>) -> beat_sync_core::Result<()> {
    if loop_size == 0 {
        return Err(beat_sync_core::BeatSyncError::InvalidConfig(
            "loop size must be non-zero",
        ));
    }
    if loop_size > MAX_LAYOUT_LOOP {
        return Err(beat_sync_core::BeatSyncError::InvalidConfig(
            "loop size too large to lay out",
        ));
    }

    // One beat per second at 1 kHz; half-second ticks see every beat.
    let track = SimulatedTrack::new(60.0, 4, loop_size * 2, 1_000).with_marker(0, "doTrack");
    let mut player = MusicPlayer::new(track)?;
    let tracker = LoopTracker::with_batch(
        player.adapter(),
        loop_size,
        batch.unwrap_or(loop_size),
    );

    let batches = Rc::new(std::cell::RefCell::new(Vec::new()));
    let _recorder = {
        let batches = Rc::clone(&batches);
        let view = tracker.view();
        tracker.events().batch_start.subscribe(move |_| {
            if let Some(state) = view.state() {
                batches
                    .borrow_mut()
                    .push((state.batch_start_beat, state.batch_end_beat));
            }
        })
    };

    player.play()?;
    for _ in 0..(u64::from(loop_size) * 4 + 4) {
        player.adapter_mut().track_mut().advance(500);
        player.update();
        if player.song_finished() {
            break;
        }
    }

    // Everything up to the second batch that opens on beat 1.
    let batches = batches.borrow();
    let layout: Vec<String> = batches
        .iter()
        .enumerate()
        .take_while(|(index, (start, _))| *index == 0 || *start != 1)
        .map(|(_, (start, end))| format!("[{start}-{end}]"))
        .collect();
    println!(
        "loop {loop_size}, max batch {}: {}",
        tracker.max_batch_size(),
        layout.join(" ")
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised timing engine driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a simulated song and log clock and tracker events.
    Simulate {
        /// JSON configuration file. Built-in defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Wall-clock seconds to simulate.
        #[arg(short, long, default_value_t = 30.0)]
        seconds: f32,
        /// Pause playback at this many seconds in.
        #[arg(long)]
        pause_at: Option<f32>,
        /// Resume playback at this many seconds in.
        #[arg(long)]
        resume_at: Option<f32>,
    },
    /// Print the batch layout of a loop.
    Layout {
        #[arg(long)]
        loop_size: u32,
        /// Maximum batch size; defaults to the loop size.
        #[arg(long)]
        batch: Option<u32>,
    },
    /// Print the default configuration as JSON.
    DumpConfig,
}

#[cfg(test)]
mod tests {
    use beat_sync_core::BeatSyncError;

    use super::*;

    #[test]
    fn layout_rejects_empty_loop() {
        let err = run_layout(0, None).unwrap_err();
        assert!(matches!(err, BeatSyncError::InvalidConfig(_)));
    }

    #[test]
    fn layout_rejects_loops_beyond_the_limit() {
        for loop_size in [MAX_LAYOUT_LOOP + 1, u32::MAX / 2 + 1, u32::MAX] {
            let err = run_layout(loop_size, Some(4)).unwrap_err();
            assert!(matches!(err, BeatSyncError::InvalidConfig(_)));
        }
    }

    #[test]
    fn layout_runs_for_a_small_loop() {
        run_layout(10, Some(4)).unwrap();
    }
}
