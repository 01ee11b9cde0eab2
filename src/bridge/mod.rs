//! Completion Bridge Module
//!
//! Turns callback-driven engine operations into calls that return only once
//! the engine has signalled completion.
//!
//! ## Responsibilities
//! - Own the single cooperative worker every engine operation runs on
//! - Carry each operation's result from its completion callback to the caller
//! - Spin the worker a bounded number of times and report timeouts as errors
//!
//! ## Drive Loop
//! ```text
//!  caller                     worker queue                engine
//!    │  send_msg(start) ───────────▶ │                        │
//!    │  poll() ─────────────────────▶│ start() ──request────▶ │
//!    │  poll() ─────────────────────▶│ ◀──────completion msg─ │
//!    │                               │ callback: complete(v)  │
//!    │  is_done()? ── yes ─▶ take(v) │                        │
//! ```

mod completion;
mod poller;
mod worker;

pub use completion::Completion;
pub use poller::{Bridge, DEFAULT_POLL_BUDGET};
pub use worker::{Message, Worker};
