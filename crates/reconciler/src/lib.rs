//! State-diffing and step-inference engine for a device-resident
//! container supervisor.
//!
//! Given a declarative target state (apps made of services, networks and
//! volumes) and the observed current state, the reconciler works out the
//! next safe steps that move the device toward the target and executes them:
//!
//! - **Compare**: pair current and target services, networks and volumes
//! - **Resolve**: pick the single next step per entity, honouring update
//!   strategies, `dependsOn`, and image availability
//! - **Sequence**: order steps across apps (kill before removing a network,
//!   download before start, ...)
//! - **Execute**: run steps concurrently, serialised per app by the update lock
//!
//! # Key Concepts
//!
//! ## Inference
//!
//! [`infer_next_steps`] is pure and synchronous. It only ever returns the
//! next steps; after they ran, the caller reads fresh state and infers again.
//!
//! ## Steps
//!
//! - `fetch` - Download an image
//! - `kill` / `stop` / `remove` - Take a container down
//! - `start` / `handover` - Bring a container up
//! - `updateMetadata` - Relabel a container without recreating it
//! - `createNetwork` / `removeNetwork` / `createVolume` / `removeVolume`
//! - `saveImage` / `removeImage` / `cleanup` - Image bookkeeping
//! - `ensureSupervisorNetwork`, `updateCommit`, `noop`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stevedore_reconciler::{
//!     ApplicationManager, InMemoryEngine, LoopConfig, ReconciliationLoop,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(InMemoryEngine::ready());
//!     let manager = Arc::new(
//!         ApplicationManager::builder()
//!             .with_engine(engine)
//!             .build()
//!             .expect("engine is set"),
//!     );
//!
//!     let mut loop_runner = ReconciliationLoop::new(manager, LoopConfig::default());
//!
//!     // Run until stopped
//!     // loop_runner.run().await;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod collaborators;
pub mod compare;
pub mod config;
pub mod contracts;
pub mod error;
pub mod executor;
pub mod images;
pub mod legacy;
pub mod lock;
pub mod r#loop;
pub mod manager;
pub mod memory;
pub mod model;
pub mod network_step;
pub mod orchestrator;
pub mod sequencer;
pub mod service_step;
pub mod status;
pub mod step;

// Re-export main types
pub use collaborators::{
    CommitStore, DependentDevices, ImageManager, NetworkManager, ServiceManager, TargetStore,
    VolumeManager,
};
pub use config::ReconcilerConfig;
pub use contracts::{ContractRequirement, DeviceCapabilities, ServiceContract};
pub use error::{Error, Result};
pub use executor::{Collaborators, ExecuteOptions, StepExecutor};
pub use lock::{with_lock, InMemoryUpdateLock, LockGuard, LockOptions, UpdateLock};
pub use manager::{ApplicationManager, ApplicationManagerBuilder, PassResult, VolatileOverride};
pub use memory::{InMemoryCommitStore, InMemoryEngine, InMemoryTargetStore, NoDependentDevices};
pub use model::{
    App, AppId, ComposeApp, ComposeService, Image, ImageId, Network, ReleaseId, Service,
    ServiceId, ServiceStatus, StartedContainers, StateSnapshot, UpdateStrategy, Volume,
};
pub use orchestrator::{infer_next_steps, ExtraState, InferenceInput};
pub use r#loop::{LoopConfig, LoopStopper, ReconciliationLoop};
pub use status::DeviceStatus;
pub use step::{Action, Step, StepKind};
