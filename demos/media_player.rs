//! Media player statechart example
//!
//! A player with a nested menu, a parallel playback state and deep history:
//! - Off: player is powered down
//! - On: browsing, with a Library (Albums, Tracks) and Settings
//! - Playback: Video and Audio regions buffering independently
//! - Playing: both regions are ready (join)
//!
//! The example shows:
//! - Nested composite states
//! - Parallel regions and a join
//! - Deep history when powering back on
//! - Timeouts driven by a `ManualTimer`
//! - Hook failures reported to a custom sink

use hierarchical_statechart::{
    Duration, Error, Event, HistoryKind, HookError, ManualTimer, StateKind, StateMachine,
    StateMachineBuilder, TransitionDef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PlayerState {
    Root,
    Off,
    On,
    Library,
    Albums,
    Tracks,
    Settings,
    Playback,
    Video,
    VideoBuffering,
    VideoReady,
    Audio,
    AudioBuffering,
    AudioReady,
    Playing,
}

#[derive(Debug, Clone, PartialEq)]
enum PlayerEvent {
    PowerOn,
    PowerOff,
    Browse,
    OpenSettings,
    Play,
    VideoBuffered,
    AudioBuffered,
    Stop,
}

#[derive(Debug, Default)]
struct PlayerContext {
    volume: u8,
    buffered: u32,
}

fn build(
    timer: &ManualTimer,
) -> Result<StateMachine<PlayerState, PlayerContext, PlayerEvent>, Error<PlayerState>> {
    use PlayerEvent as Ev;
    use PlayerState::*;

    StateMachineBuilder::new(PlayerContext {
        volume: 30,
        ..PlayerContext::default()
    })
    .top(Root, StateKind::composite(Off))
    .state(Off, Root, StateKind::Simple)
    .state(On, Root, StateKind::composite(Library))
    .state(Library, On, StateKind::composite(Albums))
    .state(Albums, Library, StateKind::Simple)
    .state(Tracks, Library, StateKind::Simple)
    .state(Settings, On, StateKind::Simple)
    .state(Playback, Root, StateKind::Parallel)
    .state(Video, Playback, StateKind::composite(VideoBuffering))
    .state(VideoBuffering, Video, StateKind::Simple)
    .state(VideoReady, Video, StateKind::Simple)
    .state(Audio, Playback, StateKind::composite(AudioBuffering))
    .state(AudioBuffering, Audio, StateKind::Simple)
    .state(AudioReady, Audio, StateKind::Simple)
    .state(Playing, Root, StateKind::Simple)
    .timer(timer.clone())
    .timeout(Settings, Duration::from_secs(10), Library)
    .on_entry(Off, |_, _| {
        println!("📴 Player off");
        Ok(())
    })
    .on_entry(Settings, |ctx: &mut PlayerContext, _| {
        println!("⚙️  Settings (volume: {}%)", ctx.volume);
        Ok(())
    })
    .on_entry(Tracks, |_, _| Err(HookError::new("track list unavailable")))
    .on_exit(Playback, |ctx: &mut PlayerContext, _| {
        ctx.buffered += 1;
        Ok(())
    })
    .on_entry(Playing, |_, _| {
        println!("▶️  Playing");
        Ok(())
    })
    .transition(Off, TransitionDef::on(Ev::PowerOn).to_history(On, HistoryKind::Deep))
    .transition(On, TransitionDef::on(Ev::PowerOff).to(Off))
    .transition(Albums, TransitionDef::on(Ev::Browse).to(Tracks))
    .transition(Library, TransitionDef::on(Ev::OpenSettings).to(Settings))
    .transition(On, TransitionDef::on(Ev::Play).to(Playback))
    .transition(
        VideoBuffering,
        TransitionDef::on(Ev::VideoBuffered).to(VideoReady),
    )
    .transition(
        AudioBuffering,
        TransitionDef::on(Ev::AudioBuffered).to(AudioReady),
    )
    .transition(
        Playback,
        TransitionDef::completion()
            .join([VideoReady, AudioReady])
            .to(Playing),
    )
    .transition(Playing, TransitionDef::on(Ev::Stop).to(On))
    .on_hook_error(|failure| {
        println!(
            "⚠️  {} hook of {:?} failed: {}",
            failure.phase, failure.state, failure.error
        )
    })
    .on_transition(|from, to, event| println!("🔀 {from:?} -> {to:?} on {event:?}"))
    .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🎵 Media Player Statechart Example");
    println!("==================================\n");

    let timer = ManualTimer::new();
    let mut player = build(&timer)?;
    player.start()?;

    println!("\n1. Power on and browse");
    player.dispatch_event(PlayerEvent::PowerOn)?;
    player.dispatch_event(PlayerEvent::Browse)?;
    println!("   Configuration: {:?}", player.current_path());

    println!("\n2. Power off and back on: deep history restores the track list");
    player.dispatch_event(PlayerEvent::PowerOff)?;
    player.dispatch_event(PlayerEvent::PowerOn)?;
    println!("   Configuration: {:?}", player.current_path());

    println!("\n3. Settings time out after 10s of inactivity");
    player.dispatch_event(PlayerEvent::OpenSettings)?;
    for token in timer.advance(Duration::from_secs(10)) {
        player.dispatch(Event::Timeout(token))?;
    }
    println!("   Configuration: {:?}", player.current_path());

    println!("\n4. Playback buffers video and audio in parallel");
    player.dispatch_event(PlayerEvent::Play)?;
    println!("   Regions: {:?}", player.active_leaf(&PlayerState::Playback));
    player.dispatch_event(PlayerEvent::VideoBuffered)?;
    let outcome = player.dispatch_event(PlayerEvent::AudioBuffered)?;
    println!(
        "   Join fired ({} transitions): {:?}",
        outcome.transitions,
        player.current_state()
    );

    println!("\n5. Unmatched events are ignored");
    let outcome = player.dispatch_event(PlayerEvent::Browse)?;
    println!("   consumed = {}", outcome.consumed);

    player.dispatch_event(PlayerEvent::Stop)?;
    player.stop()?;
    println!(
        "\n✅ Done (playback sessions: {})",
        player.context().buffered
    );
    Ok(())
}
