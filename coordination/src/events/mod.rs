//! Observation stream for debate sessions
//!
//! Everything a presentation layer may want to see — status transitions,
//! rounds, turn open/append/freeze, consensus checks, conspectus progress and
//! terminal errors — is published here. The task that drives a session
//! publishes in causal order; operator calls add their own status changes.
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! │ Debate task  │────▶│   Event Bus   │────▶│  Subscribers │
//! │   (emit)     │     │ (queue per    │     │   (recv)     │
//! │              │     │  subscriber)  │     │              │
//! └──────────────┘     └───────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver,
    SessionEmitter, SharedEventBus, Subscription,
};
pub use types::{DebateEvent, EventKind};
