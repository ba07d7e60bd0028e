//! Self-contained demo of a single-entity counter machine, a keyed
//! collection of counters, and a cross-entity total folded by an
//! aggregate composer.
//!
//! Run with: `cargo run --example counter`

use std::time::Duration;

use eventfold_bus::{
    AggregateComposer, AggregateHandlers, Entity, EventStatus, HandlerError, Handlers, KeyedStore,
    MachineEvent, Operation, SingleStore, StateMachine, defined_entity,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Counter entity
// ---------------------------------------------------------------------------

/// A named counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    id: String,
    value: i64,
}

impl Entity for Counter {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Payload naming the counter a command targets.
#[derive(Serialize)]
struct Target {
    id: String,
}

fn target(id: &str) -> Target {
    Target { id: id.to_string() }
}

fn increment(entity: Option<Counter>, id: Option<&str>) -> Counter {
    let mut counter = entity.unwrap_or_else(|| Counter {
        id: id.unwrap_or_default().to_string(),
        value: 0,
    });
    counter.value += 1;
    counter
}

// ---------------------------------------------------------------------------
// Totals aggregate (cross-entity read model)
// ---------------------------------------------------------------------------

/// Counts committed increments across every counter.
#[derive(Debug, Clone, Default)]
struct Totals {
    increments: u64,
    rejected: u64,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A singleton counter with a slow server-side confirmation.
    let global = SingleStore::new(Counter {
        id: "global".into(),
        value: 0,
    });
    let global_machine = StateMachine::builder("global", global.clone()).spawn();
    let slow_increment = global_machine.command_factory::<()>(
        "increment",
        Operation::Mutate,
        Handlers::both(
            |entity, _| defined_entity(entity).map(|c| increment(Some(c), None)),
            |entity, _| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                defined_entity(entity).map(|c| increment(Some(c), None))
            },
        ),
    );

    // A keyed collection of counters.
    let counters = KeyedStore::<Counter>::new();
    let machine = StateMachine::builder("counter", counters.clone())
        .concurrent()
        .spawn();
    let bump = machine.command_factory::<Target>(
        "increment",
        Operation::Mutate,
        Handlers::sync(|entity, event| Ok(increment(entity, event.payload_id()))),
    );
    let capped = machine.command_factory::<Target>(
        "capped_increment",
        Operation::Mutate,
        Handlers::sync(|entity, event| {
            let counter = increment(entity, event.payload_id());
            if counter.value > 2 {
                return Err(HandlerError::rejected("counter is capped at 2"));
            }
            Ok(counter)
        }),
    );
    let remove = machine.delete_factory::<Target>("remove");

    let composer = AggregateComposer::new("totals", Totals::default());
    let fold = |totals: &mut Totals, _: Option<&Counter>, event: &MachineEvent| {
        match event.status {
            EventStatus::Complete => totals.increments += 1,
            EventStatus::Error => totals.rejected += 1,
            EventStatus::Pending => {}
        }
    };
    composer.handle_entity(
        machine.subscribe(),
        AggregateHandlers::new()
            .on("increment", fold)
            .on("capped_increment", fold),
    );
    composer.handle_entity(
        global_machine.subscribe(),
        AggregateHandlers::new().on("increment", fold),
    );
    let mut updates = composer.subscribe();

    let mut progress = global_machine.subscribe_progress();
    let global_value = slow_increment.dispatch(()).await?;
    println!(
        "global: {:?} -> {:?}",
        progress.try_recv().map(|event| event.status).ok(),
        global_value.map(|c| c.value)
    );

    bump.dispatch(target("alpha")).await?;
    bump.dispatch(target("alpha")).await?;
    bump.dispatch(target("beta")).await?;
    capped.dispatch(target("alpha")).await?;
    remove.dispatch(target("beta")).await?;

    // One update per handled event: 1 global + 3 bumps + 1 capped.
    for _ in 0..5 {
        updates.recv().await?;
    }

    let totals = composer.snapshot();
    println!("counters: {:?}", counters.ids());
    println!(
        "totals: increments={}, rejected={}",
        totals.increments, totals.rejected
    );

    assert_eq!(global.current().value, 1);
    assert_eq!(counters.snapshot()["alpha"].value, 2);
    assert!(!counters.contains("beta"));
    assert_eq!(totals.increments, 4);
    assert_eq!(totals.rejected, 1);

    println!("all assertions passed");

    Ok(())
}
