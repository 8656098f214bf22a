//! End-to-end scenarios exercising the full `Model` integration: process
//! bodies written against `ProcessContext`, run to completion through
//! `Model::run`. Unit-level coverage for the individual data structures these
//! scenarios touch lives alongside each module (`resource.rs`, `pool.rs`,
//! `signal.rs`, `blocking_queue.rs`, `conveyor.rs`).

use ksl_core::executive::EndCondition;
use ksl_core::ids::EntityId;
use ksl_core::model::{Model, RunConfig};
use ksl_core::queue::Discipline;
use ksl_core::resource::{CapacityChangeNotice, CapacitySchedule};
use ksl_core::signal::Selector;
use ksl_core::stats::{FailureActions, NullCounterRecorder, ZeroDistanceOracle};
use std::cell::RefCell;
use std::rc::Rc;

/// Deterministic D/D/1 queue: arrivals every 1.0 time unit, service time
/// 0.8, one-unit server. Since service < interarrival, no customer ever
/// waits, so every seize succeeds immediately and the server is never
/// found holding more than its single unit.
#[test]
fn mm1_capacity_one_respects_server_count() {
    let model: Model<()> = Model::new();
    let server = model.register_resource("server", 1);
    let seized = Rc::new(RefCell::new(0u32));
    let released = Rc::new(RefCell::new(0u32));
    let max_busy = Rc::new(RefCell::new(0u32));

    for i in 0..100 {
        let entity = model.create_entity(format!("customer-{i}"));
        let seized = seized.clone();
        let released = released.clone();
        let max_busy = max_busy.clone();
        model
            .spawn_process(entity, i as f64, move |ctx| {
                Box::pin(async move {
                    let alloc = ctx.seize(server, 1).await?;
                    *seized.borrow_mut() += 1;
                    let busy = ctx.model().resource(server).unwrap().num_busy;
                    *max_busy.borrow_mut() = (*max_busy.borrow()).max(busy);
                    ctx.delay(0.8).await?;
                    ctx.release(server, alloc)?;
                    *released.borrow_mut() += 1;
                    Ok(())
                })
            })
            .unwrap();
    }

    model.run(RunConfig::until(EndCondition::NoEvents));

    assert_eq!(*seized.borrow(), 100);
    assert_eq!(*released.borrow(), 100);
    assert!(*max_busy.borrow() <= 1, "server capacity 1 never oversubscribed");
    let snap = model.resource(server).unwrap();
    assert_eq!(snap.available, 1);
    assert_eq!(snap.num_busy, 0);
}

/// A delays 10 starting at t=0. At t=3, B interrupts A's delay with
/// `interruptTime=2`; A's delay restarts from its full original duration,
/// so A completes at 3 + 2 + 10 = 15.
#[test]
fn interrupt_and_restart_delays_completion_to_fifteen() {
    let model: Model<()> = Model::new();
    let entity_a = model.create_entity("a");
    let entity_b = model.create_entity("b");

    let process_a = model
        .spawn_process(entity_a, 0.0, move |ctx| {
            Box::pin(async move {
                ctx.delay(10.0).await?;
                Ok(())
            })
        })
        .unwrap();

    model
        .spawn_process(entity_b, 0.0, move |ctx| {
            Box::pin(async move {
                ctx.delay(3.0).await?;
                ctx.model().interrupt_and_restart(process_a, 2.0)?;
                Ok(())
            })
        })
        .unwrap();

    let report = model.run(RunConfig::until(EndCondition::NoEvents));

    assert_eq!(model.process_elapsed(process_a), Some(15.0));
    assert_eq!(report.stopped_at, 15.0);
}

/// A pool of resources [2, 3] under the default greedy allocation draws a
/// request of 4 as 2 from the first resource and 2 from the second; both
/// child allocations release together through `release_pool`.
#[test]
fn pooled_seize_draws_across_resources_and_releases_together() {
    let model: Model<()> = Model::new();
    let r0 = model.register_resource("r0", 2);
    let r1 = model.register_resource("r1", 3);
    let pool = model.register_pool("pool", vec![r0, r1]);
    let entity = model.create_entity("requester");

    let done = Rc::new(RefCell::new(false));
    let done2 = done.clone();
    model
        .spawn_process(entity, 0.0, move |ctx| {
            Box::pin(async move {
                let pooled = ctx.seize_pool(pool, 4).await?;
                assert_eq!(ctx.model().resource(r0).unwrap().available, 0);
                assert_eq!(ctx.model().resource(r1).unwrap().available, 1);
                ctx.release_pool(pool, pooled)?;
                *done2.borrow_mut() = true;
                Ok(())
            })
        })
        .unwrap();

    model.run(RunConfig::until(EndCondition::NoEvents));

    assert!(*done.borrow());
    assert_eq!(model.resource(r0).unwrap().available, 2);
    assert_eq!(model.resource(r1).unwrap().available, 3);
}

/// A single entity rides a two-segment, five-cell conveyor end to end
/// (`request_conveyor` -> `ride_conveyor` -> `exit_conveyor`), taking one
/// cell-time per cell at unit velocity. The second-item accumulating
/// contact behaviour this belt discipline is named for is covered at the
/// `Conveyor` object level by
/// `conveyor::tests::accumulating_conveyor_second_item_stops_behind_first`;
/// this test instead verifies the suspend/resume wiring that carries a
/// request across `Model`'s request/entry/tick/exit machinery.
#[test]
fn conveyor_request_ride_exit_completes_after_travel_time() {
    use ksl_core::conveyor::{Conveyor, Discipline as ConveyorDiscipline, SegmentSpec};

    let model: Model<()> = Model::new();
    let conveyor = model
        .register_conveyor(
            Conveyor::new(
                "belt",
                vec![
                    SegmentSpec {
                        entry_location: "in".into(),
                        exit_location: "mid".into(),
                        num_cells: 4,
                    },
                    SegmentSpec {
                        entry_location: "mid".into(),
                        exit_location: "out".into(),
                        num_cells: 1,
                    },
                ],
                1.0,
                1.0,
                ConveyorDiscipline::Accumulating,
            )
            .unwrap(),
        );
    let entity = model.create_entity("item");

    let arrival_time = Rc::new(RefCell::new(None));
    let arrival_time2 = arrival_time.clone();
    model
        .spawn_process(entity, 0.0, move |ctx| {
            Box::pin(async move {
                let request = ctx.request_conveyor(conveyor, "in", 1).await?;
                ctx.ride_conveyor(request, "out").await?;
                *arrival_time2.borrow_mut() = Some(ctx.now());
                ctx.exit_conveyor(request)?;
                Ok(())
            })
        })
        .unwrap();

    model.run(RunConfig::until(EndCondition::NoEvents));

    // 5 cells at unit velocity, one cell-time each: arrives after 5 ticks.
    assert_eq!(*arrival_time.borrow(), Some(5.0));
}

/// A bounded queue (capacity 2) whose third send blocks until a
/// predicate-filtered receive frees enough room.
#[test]
fn blocking_queue_predicate_receive_frees_blocked_sender() {
    let model: Model<i32> = Model::new();
    let queue = model.register_blocking_queue("q", Some(2));
    let sender = model.create_entity("sender");
    let receiver = model.create_entity("receiver");

    let sent_all = Rc::new(RefCell::new(false));
    let sent_all2 = sent_all.clone();
    model
        .spawn_process(sender, 0.0, move |ctx| {
            Box::pin(async move {
                ctx.send(queue, 1).await?;
                ctx.send(queue, 2).await?;
                // capacity is full here; this parks until the receiver below
                // takes the `2` out.
                ctx.send(queue, 3).await?;
                *sent_all2.borrow_mut() = true;
                Ok(())
            })
        })
        .unwrap();

    let received = Rc::new(RefCell::new(None));
    let received2 = received.clone();
    model
        .spawn_process(receiver, 0.0, move |ctx| {
            Box::pin(async move {
                let items = ctx.receive(queue, 1, |x: &i32| *x > 1).await?;
                *received2.borrow_mut() = Some(items);
                Ok(())
            })
        })
        .unwrap();

    model.run(RunConfig::until(EndCondition::NoEvents));

    assert_eq!(*received.borrow(), Some(vec![2]));
    assert!(*sent_all.borrow());
}

/// Four entities park on a signal; `Signal` with a `Range(2..4)` selector
/// resumes only the 3rd and 4th (0-indexed 2 and 3), leaving the first two
/// still parked.
#[test]
fn signal_range_selector_resumes_only_the_targeted_slice() {
    let model: Model<()> = Model::new();
    let signal = model.register_signal("sig", Discipline::Fifo, ksl_core::priority::RESUME);

    let resumed: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    for i in 0..4 {
        let entity = model.create_entity(format!("waiter-{i}"));
        let resumed = resumed.clone();
        model
            .spawn_process(entity, 0.0, move |ctx| {
                Box::pin(async move {
                    ctx.wait_for_signal(signal).await;
                    resumed.borrow_mut().push(i);
                    Ok(())
                })
            })
            .unwrap();
    }

    // first run only parks all four waiters; nothing is scheduled yet.
    model.run(RunConfig::until(EndCondition::NoEvents));
    assert!(resumed.borrow().is_empty());

    let woken = model.signal(signal, Selector::Range(2..4)).unwrap();
    assert_eq!(woken, 2);

    model.run(RunConfig::until(EndCondition::NoEvents));

    let mut got = resumed.borrow().clone();
    got.sort_unstable();
    assert_eq!(got, vec![2, 3]);
}

/// A pooled seize that cannot be covered immediately parks, then resumes
/// once a release on one of the pool's member resources frees enough
/// capacity (spec §4.5's unblock condition: `Σ available_i >= amountNeeded`).
#[test]
fn pooled_seize_blocks_until_a_member_release_frees_capacity() {
    let model: Model<()> = Model::new();
    let r0 = model.register_resource("r0", 2);
    let pool = model.register_pool("pool", vec![r0]);
    let holder_entity = model.create_entity("holder");
    let waiter_entity = model.create_entity("waiter");

    // Holds both units of r0 for a while so the pool seize below has to
    // block, then releases directly (not through the pool) so the fix has
    // to notice a plain resource release can unblock a pool waiter.
    let holder_alloc = Rc::new(RefCell::new(None));
    let holder_alloc2 = holder_alloc.clone();
    let holder = model
        .spawn_process(holder_entity, 0.0, move |ctx| {
            Box::pin(async move {
                let alloc = ctx.seize(r0, 2).await?;
                *holder_alloc2.borrow_mut() = Some(alloc);
                ctx.delay(5.0).await?;
                ctx.release(r0, alloc)?;
                Ok(())
            })
        })
        .unwrap();

    let granted_at = Rc::new(RefCell::new(None));
    let granted_at2 = granted_at.clone();
    model
        .spawn_process(waiter_entity, 0.0, move |ctx| {
            Box::pin(async move {
                let pooled = ctx.seize_pool(pool, 2).await?;
                *granted_at2.borrow_mut() = Some(ctx.now());
                ctx.release_pool(pool, pooled)?;
                Ok(())
            })
        })
        .unwrap();

    model.run(RunConfig::until(EndCondition::NoEvents));

    // Before the fix, `granted_at` would stay `None` forever: the pool
    // waiter's `resolve` closure was never called.
    assert_eq!(*granted_at.borrow(), Some(5.0));
    assert_eq!(model.process_elapsed(holder), Some(5.0));
}

struct RecordingFailureActions {
    begin_calls: Rc<RefCell<Vec<(String, Vec<EntityId>)>>>,
    end_calls: Rc<RefCell<Vec<String>>>,
}

impl FailureActions for RecordingFailureActions {
    fn on_begin_failure(&mut self, resource: &str, holders: &[EntityId]) {
        self.begin_calls
            .borrow_mut()
            .push((resource.to_string(), holders.to_vec()));
    }

    fn on_end_failure(&mut self, resource: &str) {
        self.end_calls.borrow_mut().push(resource.to_string());
    }
}

/// `begin_failure` zeroes `available()` and notifies the `FailureActions`
/// hook with the entities currently holding live allocations, without
/// reclaiming them; `end_failure` clears it and unblocks a process that
/// was parked waiting for capacity (spec §4.4 "Failure").
#[test]
fn begin_and_end_failure_notify_holders_and_unblock_waiters() {
    let begin_calls = Rc::new(RefCell::new(Vec::new()));
    let end_calls = Rc::new(RefCell::new(Vec::new()));
    let model: Model<()> = Model::with_collaborators(
        NullCounterRecorder,
        ZeroDistanceOracle,
        None,
        RecordingFailureActions {
            begin_calls: begin_calls.clone(),
            end_calls: end_calls.clone(),
        },
    );

    let server = model.register_resource("server", 1);
    let holder_entity = model.create_entity("holder");
    let waiter_entity = model.create_entity("waiter");

    model
        .spawn_process(holder_entity, 0.0, move |ctx| {
            Box::pin(async move {
                let alloc = ctx.seize(server, 1).await?;
                ctx.model().begin_failure(server)?;
                ctx.delay(3.0).await?;
                ctx.model().end_failure(server)?;
                ctx.release(server, alloc)?;
                Ok(())
            })
        })
        .unwrap();

    let seized_at = Rc::new(RefCell::new(None));
    let seized_at2 = seized_at.clone();
    model
        .spawn_process(waiter_entity, 1.0, move |ctx| {
            Box::pin(async move {
                ctx.seize(server, 1).await?;
                *seized_at2.borrow_mut() = Some(ctx.now());
                Ok(())
            })
        })
        .unwrap();

    model.run(RunConfig::until(EndCondition::NoEvents));

    assert_eq!(begin_calls.borrow().len(), 1);
    assert_eq!(begin_calls.borrow()[0].0, "server");
    assert_eq!(begin_calls.borrow()[0].1, vec![holder_entity]);
    assert_eq!(end_calls.borrow().as_slice(), ["server"]);
    // The waiter can only seize once the holder both fails-ends and
    // releases at t=3.
    assert_eq!(*seized_at.borrow(), Some(3.0));
    assert!(!model.resource(server).unwrap().failed);
}

/// `use_schedule` applies its first capacity immediately and the next item
/// after its `duration`, unblocking a waiter once capacity grows (spec
/// §4.4 "UseSchedule").
#[test]
fn use_schedule_applies_capacity_changes_over_time() {
    let model: Model<()> = Model::new();
    let server = model.register_resource("server", 0);
    model
        .use_schedule(
            server,
            CapacitySchedule {
                items: vec![
                    CapacityChangeNotice { new_capacity: 0, duration: 4.0 },
                    CapacityChangeNotice { new_capacity: 1, duration: 100.0 },
                ],
                cyclic: false,
            },
        )
        .unwrap();

    let entity = model.create_entity("waiter");
    let seized_at = Rc::new(RefCell::new(None));
    let seized_at2 = seized_at.clone();
    model
        .spawn_process(entity, 0.0, move |ctx| {
            Box::pin(async move {
                ctx.seize(server, 1).await?;
                *seized_at2.borrow_mut() = Some(ctx.now());
                Ok(())
            })
        })
        .unwrap();

    assert_eq!(model.resource(server).unwrap().capacity, 0);
    model.run(RunConfig::until(EndCondition::NoEvents));

    assert_eq!(*seized_at.borrow(), Some(4.0));
    assert_eq!(model.resource(server).unwrap().capacity, 1);
}
