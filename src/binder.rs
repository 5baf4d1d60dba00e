//! Per-node directive state and the actions that apply it on each render.

use crate::{
	compiler::{CompiledHtml, Directive, DirectiveKind},
	dom::NodeId,
	events::{Handler, ListenerId},
	reconcile::{AnchorState, ForBox, Repeat},
	runtime::{InstanceId, Runtime},
	value::{Object, Value},
	Error, Result,
};
use core::mem;
use hashbrown::HashMap;
use std::rc::Rc;
use tracing::{error, trace, trace_span};

pub(crate) const PACK_ATTRIBUTE: &str = "dito-pack";
pub(crate) const USE_NAME_ATTRIBUTE: &str = "dito-use-name";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Receiver {
	Instance(InstanceId, Rc<str>),
	/// A native element, by attribute name.
	Node(NodeId, Rc<str>),
}

/// A two-way bind from a provider's state field to a receiver.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BindLink {
	pub provider: InstanceId,
	pub field: Rc<str>,
	pub receiver: Receiver,
}

/// Everything the runtime knows about a node beyond its DOM data.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeRecord {
	/// The instance whose template the node belongs to.
	pub owner: Option<InstanceId>,
	pub actions: HashMap<DirectiveKind, Vec<Directive>>,
	pub scope: Object,
	pub for_box: ForBox,
	/// Set on loop templates.
	pub repeat: Option<Repeat>,
	/// Set on loop anchors.
	pub anchor: Option<AnchorState>,
	/// The anchor and iteration index a loop clone belongs to.
	pub clone_of: Option<(NodeId, usize)>,
	/// Stands in for a hidden `@if` node.
	pub replacement: Option<NodeId>,
	pub replacement_of: Option<NodeId>,
	pub listeners: Vec<ListenerId>,
	pub binds: HashMap<Rc<str>, BindLink>,
	/// `(output, statement, owner)` handlers installed by `@o:`.
	pub outputs: Vec<(Rc<str>, Rc<str>, InstanceId)>,
	pub get_name: Option<Rc<str>>,
	/// The instance whose light DOM this node was copied from.
	pub injected_parent: Option<InstanceId>,
	/// `(expression, name)` of the `@use` an injected copy was rendered with.
	pub uses: Option<(Rc<str>, Rc<str>)>,
}

impl NodeRecord {
	pub fn directives(&self, kind: DirectiveKind) -> &[Directive] {
		self.actions.get(&kind).map_or(&[], Vec::as_slice)
	}
}

impl Runtime {
	fn directives(&self, node: NodeId, kind: DirectiveKind) -> Vec<Directive> {
		self.records.get(&node).map(|record| record.directives(kind).to_vec()).unwrap_or_default()
	}

	pub(crate) fn push_child(&mut self, owner: InstanceId, node: NodeId) {
		let instance = self.instance_mut(owner);
		if instance.child_set.insert(node) {
			instance.children.push(node);
		}
	}

	/// Turns the placeholder attributes of a freshly inserted template into node records.
	pub(crate) fn assign_children(&mut self, owner: InstanceId, root: NodeId, compiled: &CompiledHtml) -> Result<()> {
		if let Some(fors) = compiled.table(DirectiveKind::For).filter(|table| !table.is_empty()) {
			let templates: Vec<NodeId> = self
				.document
				.descendants(root)
				.into_iter()
				.filter(|&node| fors.iter().any(|(placeholder, _)| self.document.has_attribute(node, placeholder)))
				.collect();
			// Innermost first, so that outer templates see their nested anchors.
			for template in templates.into_iter().rev() {
				if let Err(error) = self.define_for(owner, template, compiled) {
					error!(?template, %error, "Loop definition failed");
				}
			}
			self.instance_mut(owner).for_nodes.reverse();
		}
		self.assign_actions(owner, root, false, compiled);
		Ok(())
	}

	/// Records every directive below `root` (and on it, if `include_root`) and returns the nodes in assignment order.
	pub(crate) fn assign_actions(&mut self, owner: InstanceId, root: NodeId, include_root: bool, compiled: &CompiledHtml) -> Vec<NodeId> {
		let mut assigned = Vec::new();
		for kind in DirectiveKind::ASSIGN_ORDER {
			let Some(table) = compiled.table(kind) else { continue };
			for (placeholder, directive) in table.iter() {
				let candidates = if include_root { self.document.subtree(root) } else { self.document.descendants(root) };
				let matches: Vec<NodeId> = candidates.into_iter().filter(|&node| self.document.has_attribute(node, placeholder)).collect();
				for node in matches {
					match self.define_child(owner, node, kind, placeholder, directive) {
						Ok(node) => assigned.push(node),
						Err(error) => error!(?node, %error, "Couldn't assign `{}`", kind.label()),
					}
				}
			}
		}
		assigned
	}

	/// Returns the node that carries the action, which differs from `node` for executables.
	fn define_child(&mut self, owner: InstanceId, node: NodeId, kind: DirectiveKind, placeholder: &str, directive: &Directive) -> Result<NodeId> {
		let node = match kind {
			DirectiveKind::Executable => {
				let text = self.document.create_text("")?;
				self.document.replace(node, text)?;
				self.document.free(node)?;
				text
			}
			DirectiveKind::Pack => {
				self.document.set_attribute(node, PACK_ATTRIBUTE, &*directive.value);
				node
			}
			DirectiveKind::UseName => {
				self.document.set_attribute(node, USE_NAME_ATTRIBUTE, &*directive.value);
				node
			}
			_ => node,
		};
		self.document.remove_attribute(node, placeholder);
		self.record_mut(node).actions.entry(kind).or_default().push(directive.clone());

		if kind.is_unique() {
			let unique = &mut self.instance_mut(owner).unique_children;
			if !unique.contains(&node) {
				unique.push(node);
			}
		} else if !self.instance(owner).child_set.contains(&node) && self.is_injected(owner, node).is_none() {
			self.push_child(owner, node);
		}

		if self.instance(owner).unique_nodes.contains(&node) {
			return Ok(node);
		}
		self.record_mut(node).owner = Some(owner);
		if kind.is_unique() {
			self.instance_mut(owner).unique_nodes.insert(node);
		}
		trace!(?node, kind = kind.label(), "Assigned");
		Ok(node)
	}

	/// The nearest component element between `node` and `owner`'s host, if `node` sits in another component's light DOM.
	pub(crate) fn is_injected(&self, owner: InstanceId, node: NodeId) -> Option<NodeId> {
		let host = self.host(owner);
		let mut found = None;
		let mut current = self.document.parent(node);
		while let Some(ancestor) = current {
			if ancestor == host {
				return found;
			}
			if found.is_none() && self.is_component_element(ancestor) {
				found = Some(ancestor);
			}
			current = self.document.parent(ancestor);
		}
		None
	}

	/// Applies a node's per-render directives. Each failing step is logged and doesn't stop the others.
	pub(crate) fn action_item(&mut self, owner: InstanceId, node: NodeId) {
		if !self.records.contains_key(&node) {
			return;
		}
		let span = trace_span!("action_item", ?owner, ?node);
		let _enter = span.enter();

		if let Err(error) = self.action_if(owner, node) {
			error!(%error, "Conditional failed");
		}
		if let Err(error) = self.action_attributes(owner, node) {
			error!(%error, "Attribute failed");
		}
		if let Err(error) = self.action_executables(owner, node) {
			error!(%error, "Executable failed");
		}
		self.setup_inputs(owner, node);
		if let Some(child) = self.instance_of(node) {
			self.queue_render(child);
		}
	}

	/// Shows or hides a node by swapping it with a persistent empty text node.
	pub(crate) fn action_if(&mut self, owner: InstanceId, node: NodeId) -> Result<()> {
		let ifs = self.directives(node, DirectiveKind::If);
		let condition = match ifs.as_slice() {
			[] => return Ok(()),
			[condition] => condition,
			_ => return Err(Error::MultipleDirectives("if")),
		};
		let replacement = match self.records.get(&node).and_then(|record| record.replacement) {
			Some(replacement) => replacement,
			None => {
				let replacement = self.document.create_text("")?;
				self.record_mut(node).replacement = Some(replacement);
				self.record_mut(replacement).replacement_of = Some(node);
				replacement
			}
		};
		if !self.document.is_connected(node) && !self.document.is_connected(replacement) {
			return Ok(());
		}

		let shown = self.execute(owner, node, &condition.value)?.is_truthy();
		if shown && !self.document.is_connected(node) {
			self.document.replace(replacement, node)?;
		} else if !shown && self.document.is_connected(node) {
			self.document.replace(node, replacement)?;
		}
		Ok(())
	}

	fn action_attributes(&mut self, owner: InstanceId, node: NodeId) -> Result<()> {
		for attribute in self.directives(node, DirectiveKind::Attribute) {
			let Some(name) = &attribute.name else { continue };
			let value = self.execute(owner, node, &attribute.value)?;
			let value = if &**name == "src" && !value.is_truthy() { String::new() } else { value.to_js_string() };
			self.document.set_attribute(node, name, value);
		}
		Ok(())
	}

	fn action_executables(&mut self, owner: InstanceId, node: NodeId) -> Result<()> {
		let executables = self.directives(node, DirectiveKind::Executable);
		let executable = match executables.as_slice() {
			[] => return Ok(()),
			[executable] => executable,
			_ => return Err(Error::MultipleDirectives("executable")),
		};
		let value = self.execute(owner, node, &executable.value)?;
		let text = if value.is_nullish() { String::new() } else { value.to_js_string() };
		#[cfg(feature = "dangerous-logging")]
		trace!(%text, "Executed");
		self.document.set_text(node, text);
		Ok(())
	}

	fn setup_inputs(&mut self, owner: InstanceId, node: NodeId) {
		for input in self.directives(node, DirectiveKind::Input) {
			if let Some(child) = self.instance_of(node) {
				self.set_input(owner, &input, node, child);
			} else if self.is_component_element(node) {
				let queued = self.instance_mut(owner).to_input.entry(node).or_default();
				if !queued.contains(&input) {
					queued.push(input);
				}
			} else {
				error!(
					"Selected node <{}> was not made with Dito and can't have an input",
					self.document.tag_name(node).unwrap_or("#text")
				);
			}
		}
	}

	/// Evaluates `@i:` in the parent and writes the result into the child's state.
	pub(crate) fn set_input(&mut self, owner: InstanceId, input: &Directive, node: NodeId, child: InstanceId) {
		let Some(name) = &input.name else { return };
		let result = self.execute(owner, node, &input.value).and_then(|value| self.set_state(child, name, value));
		if let Err(error) = result {
			error!(?child, %name, %error, "Input failed");
		}
	}

	/// Sets up the one-time actions of a node.
	pub(crate) fn setup_unique(&mut self, owner: InstanceId, node: NodeId, skip_binds: bool) {
		self.setup_events(owner, node);
		if !skip_binds {
			self.setup_binds(owner, node);
		}
		if let Err(error) = self.setup_outputs(owner, node) {
			error!(?node, %error, "Output failed");
		}
		if let Err(error) = self.setup_gets(owner, node) {
			error!(?node, %error, "Get failed");
		}
	}

	pub(crate) fn tear_unique(&mut self, owner: InstanceId, node: NodeId) {
		self.tear_events(node);
		self.tear_outputs(node);
		self.tear_gets(owner, node);
	}

	fn setup_events(&mut self, owner: InstanceId, node: NodeId) {
		for event in self.directives(node, DirectiveKind::Event) {
			let Some(name) = &event.name else { continue };
			let id = self.add_listener(node, name, Handler::Directive { owner, statement: event.value.clone() }, false);
			self.record_mut(node).listeners.push(id);
		}
	}

	fn tear_events(&mut self, node: NodeId) {
		let Some(record) = self.records.get_mut(&node) else { return };
		for id in mem::take(&mut record.listeners) {
			self.remove_event_listener(node, id);
		}
	}

	fn setup_binds(&mut self, owner: InstanceId, node: NodeId) {
		for bind in self.directives(node, DirectiveKind::Bind) {
			let Some(name) = &bind.name else { continue };
			if self.state(owner, &bind.value).map_or(true, |value| matches!(value, Value::Undefined)) {
				error!("Bound value `{}` is undefined, skipping", bind.value);
				continue;
			}
			if let Some(child) = self.instance_of(node) {
				self.set_bind(owner, &bind, child);
			} else if self.is_component_element(node) {
				self.instance_mut(owner).to_bind.push((node, bind.clone()));
			} else {
				self.setup_native_bind(owner, node, name, &bind.value);
			}
			self.push_child(owner, node);
		}
	}

	/// Binds a child component's field to one of `owner`'s fields, seeding it with the current value.
	fn set_bind(&mut self, owner: InstanceId, bind: &Directive, child: InstanceId) {
		let Some(name) = bind.name.clone() else { return };
		let link = BindLink {
			provider: owner,
			field: bind.value.clone(),
			receiver: Receiver::Instance(child, name.clone()),
		};
		let value = self.state(owner, &bind.value).cloned().unwrap_or_default();
		let instance = self.instance_mut(owner);
		if !instance.binder.contains(&link) {
			instance.binder.push(link.clone());
		}
		self.instance_mut(child).bound.insert(name.clone(), link);
		if let Err(error) = self.set_state(child, &name, value) {
			error!(?child, %error, "Bind failed");
		}
	}

	fn setup_native_bind(&mut self, owner: InstanceId, node: NodeId, attribute: &Rc<str>, field: &Rc<str>) {
		let value = self.state(owner, field).map(Value::to_js_string).unwrap_or_default();
		self.document.set_attribute(node, attribute, value);
		let link = BindLink {
			provider: owner,
			field: field.clone(),
			receiver: Receiver::Node(node, attribute.clone()),
		};
		let instance = self.instance_mut(owner);
		if !instance.binder.contains(&link) {
			instance.binder.push(link.clone());
		}
		self.record_mut(node).binds.insert(attribute.clone(), link);
		self.document.observe(node);
		let handler = Handler::NativeBind {
			owner,
			field: field.clone(),
			property: attribute.clone(),
		};
		self.add_listener(node, "change", handler, false);
	}

	/// Completes binds that were queued for component elements which have since been upgraded.
	pub(crate) fn check_binds(&mut self, owner: InstanceId) {
		let pending = mem::take(&mut self.instance_mut(owner).to_bind);
		let mut remaining = Vec::new();
		for (node, bind) in pending {
			match self.instance_of(node) {
				Some(child) => self.set_bind(owner, &bind, child),
				None => remaining.push((node, bind)),
			}
		}
		self.instance_mut(owner).to_bind.extend(remaining);
	}

	pub(crate) fn retrieve_bound_values(&mut self, id: InstanceId) {
		if let Some(parent) = self.parent(id) {
			self.check_binds(parent);
		}
	}

	/// Pushes provider values to every receiver whose copy differs.
	pub(crate) fn update_binds(&mut self, owner: InstanceId) {
		for link in self.instance(owner).binder.clone() {
			let value = self.state(owner, &link.field).cloned().unwrap_or_default();
			match &link.receiver {
				Receiver::Instance(child, field) => {
					if let Err(error) = self.set_state(*child, field, value) {
						error!(?child, %error, "Bind update failed");
					}
				}
				Receiver::Node(node, attribute) => {
					let text = value.to_js_string();
					if self.document.has_property(*node, attribute) {
						if self.document.property(*node, attribute).as_deref() != Some(text.as_str()) {
							self.document.set_property(*node, attribute, text);
						}
					} else if self.document.get_attribute(*node, attribute) != Some(text.as_str()) {
						self.document.set_attribute(*node, attribute, text);
					}
				}
			}
		}
	}

	fn setup_outputs(&mut self, owner: InstanceId, node: NodeId) -> Result<()> {
		for output in self.directives(node, DirectiveKind::Output) {
			let Some(name) = output.name.clone() else { continue };
			if !self.is_component_element(node) {
				return Err(Error::Type(format!(
					"<{}> was not made with Dito and can't have outputs",
					self.document.tag_name(node).unwrap_or("#text")
				)));
			}
			let record = self.record_mut(node);
			record.outputs.retain(|(existing, _, _)| *existing != name);
			record.outputs.push((name, output.value.clone(), owner));
		}
		Ok(())
	}

	fn tear_outputs(&mut self, node: NodeId) {
		if let Some(record) = self.records.get_mut(&node) {
			record.outputs.clear();
		}
	}

	fn setup_gets(&mut self, owner: InstanceId, node: NodeId) -> Result<()> {
		let gets = self.directives(node, DirectiveKind::Get);
		let get = match gets.as_slice() {
			[] => return Ok(()),
			[get] => get,
			_ => return Err(Error::MultipleDirectives("get")),
		};
		let name: Rc<str> = self.execute(owner, node, &get.value)?.to_property_key().into();
		self.record_mut(node).get_name = Some(name.clone());
		self.instance_mut(owner).gets.insert(name, node);
		Ok(())
	}

	fn tear_gets(&mut self, owner: InstanceId, node: NodeId) {
		let Some(name) = self.records.get_mut(&node).and_then(|record| record.get_name.take()) else { return };
		let gets = &mut self.instance_mut(owner).gets;
		if gets.get(&name) == Some(&node) {
			gets.remove(&name);
		}
	}

	/// Whether a child can be dropped from the render list: detached, and not hidden by an `@if` or injected into a live host.
	pub(crate) fn should_remove_child(&self, child: NodeId) -> bool {
		if self.document.is_connected(child) || self.is_in_if(child, true).is_some() {
			return false;
		}
		let injected_parent = self.records.get(&child).and_then(|record| record.injected_parent);
		!injected_parent.map_or(false, |parent| self.document.is_connected(self.host(parent)))
	}

	/// The nearest node at or above `node` that has an `@if`, following hidden nodes through their replacements.
	///
	/// With `in_document`, only an `@if` node that is itself connected or whose replacement is counts.
	pub(crate) fn is_in_if(&self, node: NodeId, in_document: bool) -> Option<NodeId> {
		let mut current = Some(node);
		while let Some(candidate) = current {
			let record = self.records.get(&candidate);
			let replacement = record.and_then(|record| record.replacement);
			if record.map_or(false, |record| !record.directives(DirectiveKind::If).is_empty())
				&& (!in_document
					|| self.document.is_connected(candidate)
					|| replacement.map_or(false, |replacement| self.document.is_connected(replacement)))
			{
				return Some(candidate);
			}
			current = self
				.document
				.parent(candidate)
				.or_else(|| replacement.and_then(|replacement| self.document.parent(replacement)));
		}
		None
	}
}
