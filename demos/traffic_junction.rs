//! Traffic junction example on the tokio runtime
//!
//! The junction light cycles Green -> Yellow -> Red on timeouts. A
//! pedestrian request forces a walk phase, and a fault switches to flashing
//! mode until reset.
//!
//! The example shows:
//! - `TokioTimer` delivering timeouts through the event loop
//! - Several producers feeding one machine through an mpsc channel
//! - Environment configuration combined with the strict error policy

use hierarchical_statechart::runtime::{EventLoop, TokioTimer};
use hierarchical_statechart::{
    Duration, ErrorPolicy, MachineConfig, StateKind, StateMachineBuilder, TransitionDef,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Light {
    Junction,
    Cycling,
    Green,
    Yellow,
    Red,
    Walk,
    Flashing,
}

#[derive(Debug, Clone, PartialEq)]
enum Signal {
    PedestrianRequest,
    Fault,
    Reset,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: u32,
    crossings: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🚦 Traffic Junction Example");
    println!("===========================\n");

    let (timer, timeouts) = TokioTimer::new();
    let config = MachineConfig::from_env().with_error_policy(ErrorPolicy::Strict);

    let mut junction = StateMachineBuilder::new(Counters::default())
        .top(Light::Junction, StateKind::composite(Light::Cycling))
        .state(Light::Cycling, Light::Junction, StateKind::composite(Light::Green))
        .state(Light::Green, Light::Cycling, StateKind::Simple)
        .state(Light::Yellow, Light::Cycling, StateKind::Simple)
        .state(Light::Red, Light::Cycling, StateKind::Simple)
        .state(Light::Walk, Light::Junction, StateKind::Simple)
        .state(Light::Flashing, Light::Junction, StateKind::Simple)
        .config(config)
        .timer(timer)
        .timeout(Light::Green, Duration::from_millis(300), Light::Yellow)
        .timeout(Light::Yellow, Duration::from_millis(100), Light::Red)
        .timeout(Light::Red, Duration::from_millis(300), Light::Green)
        .timeout(Light::Walk, Duration::from_millis(200), Light::Cycling)
        .on_entry(Light::Green, |counters: &mut Counters, _| {
            counters.cycles += 1;
            println!("🟢 Green (cycle {})", counters.cycles);
            Ok(())
        })
        .on_entry(Light::Yellow, |_, _| {
            println!("🟡 Yellow");
            Ok(())
        })
        .on_entry(Light::Red, |_, _| {
            println!("🔴 Red");
            Ok(())
        })
        .on_entry(Light::Walk, |counters: &mut Counters, _| {
            counters.crossings += 1;
            println!("🚶 Walk");
            Ok(())
        })
        .on_entry(Light::Flashing, |_, _| {
            println!("⚠️  Flashing");
            Ok(())
        })
        .transition(
            Light::Cycling,
            TransitionDef::on(Signal::PedestrianRequest).to(Light::Walk),
        )
        .transition(Light::Junction, TransitionDef::on(Signal::Fault).to(Light::Flashing))
        .transition(Light::Flashing, TransitionDef::on(Signal::Reset).to(Light::Cycling))
        .build()?;

    let (tx, rx) = mpsc::channel(8);
    let pedestrian = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = pedestrian.send(Signal::PedestrianRequest).await;
    });
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let _ = tx.send(Signal::Fault).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(Signal::Reset).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
    });

    let dispatched = EventLoop::new(rx, timeouts).run(&mut junction).await?;

    let counters = junction.context();
    println!(
        "\n✅ {} events dispatched, {} cycles, {} crossings, ending in {:?}",
        dispatched,
        counters.cycles,
        counters.crossings,
        junction.current_state()
    );
    Ok(())
}
