//! Ring conveyor dispatch engine.
//!
//! ## Overview
//!
//! Carriers ride a closed loop of gated checkpoints. The hardware only
//! reports "is a carrier sitting here" per checkpoint and accepts three
//! commands: advance one carrier, hold a gate open, close it. Callers ask
//! for whole moves ("pick from storage", "move carrier X to checkpoint Y",
//! "send X to storage"); the dispatcher turns each into a wave of single
//! gate actuations, confirming every step against the sensors and recording
//! queue changes in the store as they happen.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Caller  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ Dispatcher::move_to_lock() ...         │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (Dispatcher, op mutex)         │
//!                       │     │           │                   │            │
//!                       │     v           v                   v            │
//!                       │  topology.rs  store.rs        gateway.rs         │
//!                       │  (routes)     (SQLite)        (HardwareGateway)  │
//!                       │                                 │        │       │
//!                       │                         HttpGateway  simulator.rs│
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                            |
//! |-------------|-----------------------------------------------------------|
//! | `models`    | Shared types: `Carrier`, `CheckpointQueue`, snapshots     |
//! | `store`     | SQLite access via `StoreHandle` (thin `Arc<Mutex<_>>`)    |
//! | `events`    | `DispatchEvent` enum + `broadcast_event()` helper         |
//! | `simulator` | In-process conveyor used by tests and `serve --simulate`  |
//!
//! ## Typical Request Flow (move carrier)
//!
//! 1. `POST /api/v1/carriers/{id}/move` → `api::move_carrier()`
//! 2. `Dispatcher::move_to_lock()` takes the operation mutex, so no other
//!    move can interleave with this one.
//! 3. Every carrier the move will touch is checked for availability before
//!    any gate moves. A failure here leaves hardware and store untouched.
//! 4. The destination is cleared onto the checkpoint after it, the carrier's
//!    home releases it (and anything ahead of it), the gates in between open,
//!    and the destination passes everything but the target carrier onward.
//! 5. The store is updated as each arrival is confirmed; a gateway failure
//!    after the first actuation surfaces as `Stranded` with the carriers
//!    left in transit.
//! 6. The handler broadcasts a `carrier_moved` event to `/ws` subscribers.

pub mod api;
pub mod events;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod simulator;
pub mod store;
pub mod topology;

pub use gateway::{HardwareGateway, HttpGateway};
pub use orchestrator::{Dispatcher, DispatcherConfig};
pub use simulator::SimulatedConveyor;
pub use store::{CarrierStore, StoreHandle};
pub use topology::RingTopology;
