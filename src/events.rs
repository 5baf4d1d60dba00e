//! Event listeners on arena nodes, and delivery of attribute mutations to two-way binds.

use crate::{
	dom::NodeId,
	runtime::{InstanceId, Runtime},
	value::{Object, Value},
};
use core::{
	cell::RefCell,
	fmt::{self, Debug, Formatter},
};
use std::rc::Rc;
use tracing::{error, trace, trace_span};

/// Handle of a registered listener, for [`Runtime::remove_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub name: Rc<str>,
	pub target: NodeId,
	/// The node whose listener is running.
	pub current_target: NodeId,
	pub detail: Value,
}

impl Event {
	/// The `$event` object handler statements see.
	#[must_use]
	pub fn to_value(&self) -> Value {
		let mut object = Object::new();
		object.insert("type", Value::String(self.name.clone()));
		object.insert("target", Value::Node(self.target));
		object.insert("currentTarget", Value::Node(self.current_target));
		object.insert("detail", self.detail.clone());
		Value::object(object)
	}
}

pub(crate) type Callback = Rc<RefCell<dyn FnMut(&Event)>>;

#[derive(Clone)]
pub(crate) enum Handler {
	/// An `@e:` statement run on behalf of `owner`.
	Directive { owner: InstanceId, statement: Rc<str> },
	/// Writes a native element's property back into `owner`'s state.
	NativeBind { owner: InstanceId, field: Rc<str>, property: Rc<str> },
	/// A child finished loading; see [`Runtime::finish_load`].
	LoadFinished { waiter: InstanceId },
	Callback(Callback),
}

impl Debug for Handler {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Self::Directive { owner, statement } => f.debug_struct("Directive").field("owner", owner).field("statement", statement).finish(),
			Self::NativeBind { owner, field, property } => f
				.debug_struct("NativeBind")
				.field("owner", owner)
				.field("field", field)
				.field("property", property)
				.finish(),
			Self::LoadFinished { waiter } => f.debug_struct("LoadFinished").field("waiter", waiter).finish(),
			Self::Callback(_) => f.write_str("Callback"),
		}
	}
}

#[derive(Debug, Clone)]
pub(crate) struct Listener {
	pub id: ListenerId,
	pub event: Rc<str>,
	pub handler: Handler,
	pub once: bool,
}

impl Runtime {
	/// Calls `callback` whenever an event named `event` reaches `node`.
	pub fn add_event_listener(&mut self, node: NodeId, event: &str, callback: impl FnMut(&Event) + 'static) -> ListenerId {
		self.add_listener(node, event, Handler::Callback(Rc::new(RefCell::new(callback))), false)
	}

	/// Returns whether the listener was still registered.
	pub fn remove_event_listener(&mut self, node: NodeId, id: ListenerId) -> bool {
		let Some(listeners) = self.listeners.get_mut(&node) else { return false };
		let before = listeners.len();
		listeners.retain(|listener| listener.id != id);
		before != listeners.len()
	}

	pub(crate) fn add_listener(&mut self, node: NodeId, event: &str, handler: Handler, once: bool) -> ListenerId {
		let id = ListenerId(self.next_listener);
		self.next_listener += 1;
		trace!(?node, event, ?id, "Adding listener");
		self.listeners.entry(node).or_default().push(Listener {
			id,
			event: event.into(),
			handler,
			once,
		});
		id
	}

	/// Dispatches a bubbling event without detail, like a user interaction would.
	pub fn dispatch_event(&mut self, target: NodeId, name: &str) {
		self.dispatch_custom_event(target, name, Value::Undefined, true);
	}

	pub fn dispatch_custom_event(&mut self, target: NodeId, name: &str, detail: Value, bubbles: bool) {
		let mut path = vec![target];
		if bubbles {
			let mut current = self.document.parent(target);
			while let Some(node) = current {
				path.push(node);
				current = self.document.parent(node);
			}
		}
		let span = trace_span!("dispatch", ?target, name);
		let _enter = span.enter();
		let mut event = Event {
			name: name.into(),
			target,
			current_target: target,
			detail,
		};
		for node in path {
			let matching: Vec<(ListenerId, Handler, bool)> = self
				.listeners
				.get(&node)
				.map(|listeners| {
					listeners
						.iter()
						.filter(|listener| *listener.event == *name)
						.map(|listener| (listener.id, listener.handler.clone(), listener.once))
						.collect()
				})
				.unwrap_or_default();
			event.current_target = node;
			for (id, handler, once) in matching {
				// An earlier handler may have removed this one.
				let registered = if once {
					self.remove_event_listener(node, id)
				} else {
					self.listeners.get(&node).map_or(false, |listeners| listeners.iter().any(|listener| listener.id == id))
				};
				if registered {
					self.invoke(node, handler, &event);
				}
			}
		}
	}

	/// Lifecycle notifications on a host. They don't bubble.
	pub(crate) fn emit_event(&mut self, host: NodeId, name: &str) {
		self.dispatch_custom_event(host, name, Value::Undefined, false);
	}

	fn invoke(&mut self, node: NodeId, handler: Handler, event: &Event) {
		match handler {
			Handler::Directive { owner, statement } => {
				if let Err(error) = self.run_function(owner, node, &statement, event.to_value()) {
					error!(?owner, %error, "Event handler failed");
				}
			}
			Handler::NativeBind { owner, field, property } => {
				let Some(current) = self.document.property(node, &property) else { return };
				if self.state(owner, &field).map_or(false, |value| value.to_js_string() == current) {
					return;
				}
				if let Err(error) = self.set_state(owner, &field, Value::from(current)) {
					error!(?owner, %error, "Bind write-back failed");
				}
			}
			Handler::LoadFinished { waiter } => self.finish_load(waiter),
			Handler::Callback(callback) => {
				let Ok(mut callback) = callback.try_borrow_mut() else {
					return error!("Listener callback is already running");
				};
				(&mut *callback)(event);
			}
		}
	}

	/// Writes attribute changes on natively bound elements back into their provider's state.
	pub(crate) fn deliver_mutations(&mut self) {
		for mutation in self.document.take_mutations() {
			let Some(link) = self
				.records
				.get(&mutation.target)
				.and_then(|record| record.binds.get(mutation.attribute.as_str()))
				.cloned()
			else {
				continue;
			};
			let Some(value) = self.document.get_attribute(mutation.target, &mutation.attribute).map(str::to_owned) else {
				continue;
			};
			if self.state(link.provider, &link.field).map_or(false, |current| current.to_js_string() == value) {
				continue;
			}
			trace!(target = ?mutation.target, attribute = %mutation.attribute, "Bound attribute changed");
			if let Err(error) = self.set_state(link.provider, &link.field, Value::from(value)) {
				error!(%error, "Bind write-back failed");
			}
		}
	}
}
