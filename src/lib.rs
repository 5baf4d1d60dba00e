#![doc(html_root_url = "https://docs.rs/dito/0.1.0")]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
//! Reactive web components on an arena DOM.
//!
//! Component templates carry directives (`@if`, `@for`, `@a:`, `@e:`, `{{ … }}` and friends) which are compiled once per
//! component type into placeholder attributes. Instances then re-render on a debounced virtual clock whenever their
//! state changes, updating only the nodes those directives touch.

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}

mod binder;
pub mod compiler;
mod component;
pub mod dom;
mod error;
pub mod eval;
mod events;
pub mod expr;
mod html;
mod inject;
#[cfg(target_arch = "wasm32")]
pub mod load;
pub mod observable;
mod rc_hash_map;
mod reconcile;
mod runtime;
mod scheduler;
mod selector;
mod stylesheet;
pub mod value;

pub use component::{ComponentClass, Context, DefaultKind, Defaults, Factory, Lifecycle};
pub use dom::{Document, NodeId};
pub use error::{Error, Result};
pub use events::{Event, ListenerId};
pub use runtime::{InstanceId, Runtime, Settings, READY_ATTRIBUTE, SHOW_ATTRIBUTE};
pub use stylesheet::Stylesheet;
pub use value::Value;
