//! Keyed store: pedometers created, stepped, confirmed, hydrated, and
//! deleted, with a cross-entity aggregate folded over two machines.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use eventfold_bus::{
    AggregateComposer, AggregateHandlers, AggregateUpdate, CommandFactory, DispatchError, Entity,
    EventStatus, HandlerError, Handlers, KeyedStore, MachineEvent, Operation, StateMachine,
    defined_entity,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Entities and payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Pedometer {
    id: String,
    steps: u32,
    #[serde(default)]
    heart_rate: Option<u32>,
}

impl Entity for Pedometer {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Runner {
    id: String,
    name: String,
}

impl Entity for Runner {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Serialize, Deserialize)]
struct Create {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct Step {
    id: String,
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct HeartRate {
    id: String,
    bpm: u32,
}

#[derive(Serialize)]
struct Target {
    id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Dashboard {
    total_steps: u32,
    pedometers: u32,
    runners: Vec<String>,
}

// ---------------------------------------------------------------------------
// Machine wiring
// ---------------------------------------------------------------------------

struct Pedometers {
    store: KeyedStore<Pedometer>,
    machine: StateMachine<Pedometer>,
    create: CommandFactory<Pedometer, Create>,
    step: CommandFactory<Pedometer, Step>,
    heart_rate: CommandFactory<Pedometer, HeartRate>,
    hydrate: CommandFactory<Pedometer, Pedometer>,
    delete: CommandFactory<Pedometer, Target>,
}

fn pedometers(confirm_bpm_limit: u32) -> Pedometers {
    let store = KeyedStore::<Pedometer>::new();
    let machine = StateMachine::builder("pedometer", store.clone()).spawn();

    let create = machine.command_factory(
        "create",
        Operation::Set,
        Handlers::sync(|_, event| {
            let Create { id } = event.payload_as()?;
            Ok(Pedometer {
                id,
                ..Pedometer::default()
            })
        }),
    );
    let step = machine.command_factory(
        "step",
        Operation::Mutate,
        Handlers::sync(|entity, event| {
            let mut pedometer: Pedometer = defined_entity(entity)?;
            let Step { count, .. } = event.payload_as()?;
            pedometer.steps += count;
            Ok(pedometer)
        }),
    );
    // Optimistically show the reading, then confirm it with the sensor.
    let heart_rate = machine.command_factory(
        "heart_rate",
        Operation::Mutate,
        Handlers::both(
            |entity, event| {
                let mut pedometer: Pedometer = defined_entity(entity)?;
                let HeartRate { bpm, .. } = event.payload_as()?;
                pedometer.heart_rate = Some(bpm);
                Ok(pedometer)
            },
            move |entity, event| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                confirm_heart_rate(entity, &event, confirm_bpm_limit)
            },
        ),
    );
    let hydrate = machine.hydrate_factory("hydrate");
    let delete = machine.delete_factory("delete");

    Pedometers {
        store,
        machine,
        create,
        step,
        heart_rate,
        hydrate,
        delete,
    }
}

fn confirm_heart_rate(
    entity: Option<Pedometer>,
    event: &MachineEvent,
    limit: u32,
) -> Result<Pedometer, HandlerError> {
    let mut pedometer: Pedometer = defined_entity(entity)?;
    let HeartRate { bpm, .. } = event.payload_as()?;
    if bpm > limit {
        return Err(HandlerError::rejected("sensor did not confirm reading"));
    }
    pedometer.heart_rate = Some(bpm);
    Ok(pedometer)
}

async fn next_update(
    rx: &mut broadcast::Receiver<AggregateUpdate<Dashboard>>,
) -> AggregateUpdate<Dashboard> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for dashboard update")
        .expect("dashboard channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_then_step() {
    let p = pedometers(200);

    p.create.dispatch(Create { id: "p-1".into() }).await.unwrap();
    let stepped = p
        .step
        .dispatch(Step {
            id: "p-1".into(),
            count: 12,
        })
        .await
        .unwrap();

    assert_eq!(stepped.map(|p| p.steps), Some(12));
    assert_eq!(p.store.ids(), vec!["p-1".to_string()]);
}

#[tokio::test]
async fn step_on_unknown_pedometer_is_an_error_event() {
    let p = pedometers(200);
    let mut emissions = p.machine.subscribe();

    let result = p
        .step
        .dispatch(Step {
            id: "ghost".into(),
            count: 1,
        })
        .await
        .unwrap();

    assert_eq!(result, None);
    assert!(p.store.is_empty());
    let emission = emissions.recv().await.unwrap();
    assert_eq!(emission.event.status, EventStatus::Error);
    assert!(!emission.event.entity_in_store);
}

#[tokio::test]
async fn confirmed_heart_rate_is_committed() {
    let p = pedometers(200);
    p.create.dispatch(Create { id: "p-1".into() }).await.unwrap();

    let result = p
        .heart_rate
        .dispatch(HeartRate {
            id: "p-1".into(),
            bpm: 72,
        })
        .await
        .unwrap();

    assert_eq!(result.and_then(|p| p.heart_rate), Some(72));
}

#[tokio::test]
async fn optimistic_heart_rate_is_visible_then_rolled_back() {
    let p = pedometers(180);
    p.create.dispatch(Create { id: "p-1".into() }).await.unwrap();

    let store = p.store.clone();
    let reading = {
        let heart_rate = p.heart_rate.clone();
        tokio::spawn(async move {
            heart_rate
                .dispatch(HeartRate {
                    id: "p-1".into(),
                    bpm: 220,
                })
                .await
        })
    };

    // Inside the confirmation window the optimistic value is in the store.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        store.snapshot().get("p-1").and_then(|p| p.heart_rate),
        Some(220)
    );

    let result = reading.await.unwrap().unwrap();
    assert_eq!(result.and_then(|p| p.heart_rate), None);
    assert_eq!(
        store.snapshot().get("p-1").and_then(|p| p.heart_rate),
        None
    );
}

#[tokio::test]
async fn hydrate_then_delete() {
    let p = pedometers(200);
    let saved = Pedometer {
        id: "p-7".into(),
        steps: 9000,
        heart_rate: Some(64),
    };

    let hydrated = p.hydrate.dispatch(saved.clone()).await.unwrap();
    assert_eq!(hydrated, Some(saved));

    p.delete.dispatch(Target { id: "p-7".into() }).await.unwrap();
    assert!(p.store.is_empty());

    // Deleting again is a no-op.
    p.delete.dispatch(Target { id: "p-7".into() }).await.unwrap();
    assert!(p.store.is_empty());
}

#[tokio::test]
async fn pass_through_without_id_is_rejected_at_dispatch() {
    let p = pedometers(200);
    let hydrate = p.machine.hydrate_factory::<serde_json::Value>("hydrate");

    let err = hydrate
        .dispatch(serde_json::json!({ "steps": 3 }))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::MissingId), "got: {err:?}");
}

#[tokio::test]
async fn dashboard_folds_two_entity_types() {
    let p = pedometers(200);
    let runners_store = KeyedStore::<Runner>::new();
    let runners = StateMachine::builder("runner", runners_store.clone()).spawn();
    let register = runners.hydrate_factory::<Runner>("register");

    let dashboard = Arc::new(RwLock::new(Dashboard::default()));
    let composer = AggregateComposer::builder("dashboard", Arc::clone(&dashboard)).build();
    let mut updates = composer.subscribe();

    composer.handle_entity(
        p.machine.subscribe(),
        AggregateHandlers::new()
            .on("create", |dash: &mut Dashboard, _, event| {
                if event.status == EventStatus::Complete {
                    dash.pedometers += 1;
                }
            })
            .on("step", |dash: &mut Dashboard, _, event| {
                if event.status == EventStatus::Complete
                    && let Some(count) = event.payload.get("count").and_then(|c| c.as_u64())
                {
                    dash.total_steps += count as u32;
                }
            }),
    );

    p.create.dispatch(Create { id: "p-1".into() }).await.unwrap();
    p.step
        .dispatch(Step {
            id: "p-1".into(),
            count: 40,
        })
        .await
        .unwrap();
    next_update(&mut updates).await;
    next_update(&mut updates).await;

    // A source added later reaches the existing subscriber.
    composer.handle_entity(
        runners.subscribe(),
        AggregateHandlers::new().on("register", |dash: &mut Dashboard, runner: Option<&Runner>, _| {
            if let Some(runner) = runner {
                dash.runners.push(runner.name.clone());
            }
        }),
    );
    register
        .dispatch(Runner {
            id: "r-1".into(),
            name: "Ada".into(),
        })
        .await
        .unwrap();

    let update = next_update(&mut updates).await;
    assert_eq!(update.event.aggregate_name, "dashboard");
    assert_eq!(update.event.event.entity_name, "runner");
    assert_eq!(
        update.aggregate,
        Dashboard {
            total_steps: 40,
            pedometers: 1,
            runners: vec!["Ada".to_string()],
        }
    );
    assert_eq!(composer.source_count(), 2);
    assert_eq!(*dashboard.read().unwrap(), update.aggregate);
}
