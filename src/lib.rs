//! An observable state-binding framework
//!
//! Tether keeps application state and its observers synchronized without
//! manual bookkeeping. It provides three cooperating pieces:
//! * An [`EventChannel`](events::EventChannel) — named-event pub/sub with
//!   wildcard and delegated subscriptions and synchronous, reentrancy-safe
//!   dispatch.
//! * A [`Model`](model::Model) — an observable attribute bag whose `set`
//!   operation diffs proposed values against current state and notifies
//!   per-attribute and aggregate subscribers, tracking net changes across
//!   a whole change cycle even when handlers mutate the model again.
//! * A [`Collection`](collection::Collection) — an ordered, indexed set of
//!   models with merge semantics, kept consistent as members come, go, and
//!   change identity, re-broadcasting member events to its own
//!   subscribers.
//!
//! Models and collections can optionally persist through an injected
//! [`Transport`](sync::Transport); the engine only interprets the
//! success/error completion contract. A small fragment
//! [`Router`](router::Router) rounds out the set for applications that
//! drive state from URL fragments.
//!
//! Everything is single-threaded and cooperative: handlers run on the
//! caller's stack and are free to call back into the framework.
//!
//! ```rust
//! use tether::prelude::*;
//! use serde_json::json;
//!
//! let todo = Model::new(Attributes::new());
//! todo.on(
//!     "change:title",
//!     callback(|_name, event| {
//!         if let Event::ChangeAttr { value, .. } = event {
//!             println!("title is now {value:?}");
//!         }
//!     }),
//! );
//! todo.set_attr("title", json!("Write the docs")).unwrap();
//! ```

pub mod collection;
pub mod error;
pub mod events;
pub mod log;
pub mod model;
pub mod prelude;
pub mod router;
pub mod sync;
pub mod value;

pub use collection::{Collection, CollectionOptions};
pub use error::TetherError;
pub use events::{callback, Event, EventChannel};
pub use crate::log::{debug, error, info, trace, warn};
pub use model::{Attributes, Model, ModelOptions};
pub use router::Router;
pub use sync::{Method, Transport};
