//! Progress events for external observers.
//!
//! The engine publishes one [`ProgressEvent`] per state transition on a
//! Tokio broadcast [`EventBus`]. Delivery is best-effort; publishing never
//! blocks deliberation.
//!
//! ```ignore
//! let mut rx = engine.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{}", event.event_type());
//! }
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, SharedEventBus};
pub use types::ProgressEvent;
