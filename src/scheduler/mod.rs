//! Task scheduling core.
//!
//! ## Overview
//!
//! Clients create tasks over the API; the scheduler records each task in
//! the in-memory [`store::TaskStore`], pushes its id through a bounded
//! admission queue, and a fixed pool of workers pulls ids off the queue
//! and drives them to a terminal state via the executor dispatch. Every
//! lifecycle change is fanned out to per-task WebSocket subscribers
//! through the progress hub.
//!
//! ```text
//! submit ──> TaskStore (pending) ──> admission queue ──┐
//!                                                      v
//!                     worker 0..N ── dequeue ── running ── executor
//!                                                      │
//!                 completed / failed <─────────────────┘
//!                        │
//!                        └──> ProgressHub ──> subscribers
//! ```
//!
//! The sweeper runs beside the pool and evicts terminal tasks once they
//! age past the retention window.

pub mod service;
pub mod store;
pub mod sweeper;
pub mod task;

pub use service::{ProgressReporter, TaskScheduler};
pub use store::TaskStore;
pub use task::{JsonObject, Task, TaskKind, TaskStatus};
