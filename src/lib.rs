//! Kernel of a process-interaction discrete-event simulation engine.
//!
//! A simulation owns one [`model::Model`], which is generic over the item
//! type carried by its [`blocking_queue::BlockingQueue`]s. Process bodies
//! are ordinary `async move { ... }` blocks written against
//! [`builder::ProcessContext`] and registered with
//! [`model::Model::spawn_process`]; every suspension point in spec-speak
//! (`Delay`, `Seize`, `Hold`, `WaitForSignal`, `Send`/`Receive`,
//! `RequestConveyor`/`RideConveyor`, `Move`, `WaitFor`) is one `.await` on a
//! `ProcessContext` method.
//!
//! ```no_run
//! use ksl_core::model::{Model, RunConfig};
//! use ksl_core::executive::EndCondition;
//!
//! let model: Model<()> = Model::new();
//! let server = model.register_resource("server", 1);
//! let entity = model.create_entity("customer-0");
//! model
//!     .spawn_process(entity, 0.0, move |ctx| {
//!         Box::pin(async move {
//!             let alloc = ctx.seize(server, 1).await?;
//!             ctx.delay(5.0).await?;
//!             ctx.release(server, alloc)?;
//!             Ok(())
//!         })
//!     })
//!     .unwrap();
//! model.run(RunConfig::until(EndCondition::NoEvents));
//! ```
//!
//! Collaborators the core never implements itself (spec §1) — statistics
//! aggregation, geometry, random-variate generation — are supplied by the
//! host through the narrow traits in [`stats`].

pub mod blocking_queue;
pub mod builder;
pub mod conveyor;
pub mod entity;
pub mod error;
pub mod event;
pub mod executive;
pub mod ids;
pub mod model;
pub mod pool;
pub mod priority;
pub mod process;
pub mod queue;
pub mod resource;
pub mod signal;
pub mod stats;

pub use builder::ProcessContext;
pub use error::{KslError, KslResult};
pub use model::{Model, RunConfig, RunReport};
