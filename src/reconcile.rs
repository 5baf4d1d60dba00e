//! `@for` loops: anchors, keyed clones and nested anchors.
//!
//! A loop template is taken out of the document and replaced by an anchor, before which one clone per iteration is kept.
//! Re-rendering recycles the existing clones in place, only appending or truncating at the end.

use crate::{
	binder::{NodeRecord, Receiver},
	compiler::{CompiledHtml, DirectiveKind},
	dom::NodeId,
	runtime::{InstanceId, Runtime},
	value::{string_to_number, Object, Value},
	Error, Result,
};
use hashbrown::HashSet;
use num_traits::ToPrimitive;
use std::rc::Rc;
use tracing::{error, instrument, trace};

pub(crate) const ANCHOR_ATTRIBUTE: &str = "dito-anchor";
pub(crate) const ANCHOR_ALIAS_ATTRIBUTE: &str = "dito-anchor-alias";

/// Loop variables of a node.
#[derive(Debug, Clone)]
pub(crate) struct ForBox {
	/// Whether the node is a loop clone or inside one.
	pub is_item: bool,
	pub key: Value,
	pub value: Value,
	pub key_name: Option<Rc<str>>,
	pub value_name: Option<Rc<str>>,
	/// Selector paths from a template to its nested anchors.
	pub anchors: Vec<String>,
	/// The outer anchor and iteration an injected nested anchor was rendered for.
	pub inject_parent: Option<(NodeId, usize)>,
}

impl Default for ForBox {
	fn default() -> Self {
		Self {
			is_item: false,
			key: Value::Null,
			value: Value::Null,
			key_name: None,
			value_name: None,
			anchors: Vec::new(),
			inject_parent: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Repeat {
	pub condition: Rc<str>,
	/// Every anchor the template renders at. Nested loops have one per outer iteration.
	pub anchors: Vec<NodeId>,
	pub min: Option<Rc<str>>,
	pub min_default: Option<Rc<str>>,
}

#[derive(Debug, Clone)]
pub(crate) struct AnchorState {
	pub template: NodeId,
	/// One clone per iteration.
	pub children: Vec<NodeId>,
	/// Action-bearing nodes of each clone.
	pub for_generated: Vec<Vec<NodeId>>,
	/// Nested anchors of each clone.
	pub anchor_generated: Vec<Vec<NodeId>>,
}

impl AnchorState {
	pub fn new(template: NodeId) -> Self {
		Self {
			template,
			children: Vec::new(),
			for_generated: Vec::new(),
			anchor_generated: Vec::new(),
		}
	}
}

fn merge_into(scope: &mut Object, overrides: &Object) {
	for (name, value) in overrides.iter() {
		scope.insert(name.clone(), value.clone());
	}
}

/// Lengths follow `new Array(n)`: whole numbers up to 2³²−1.
fn array_length(n: f64) -> Result<usize> {
	let invalid = || Error::Range("Invalid array length".to_owned());
	if n.fract() != 0.0 {
		return Err(invalid());
	}
	n.to_u32().and_then(|n| usize::try_from(n).ok()).ok_or_else(invalid)
}

fn ensure_slot(lists: &mut Vec<Vec<NodeId>>, index: usize) -> &mut Vec<NodeId> {
	if lists.len() <= index {
		lists.resize_with(index + 1, Vec::new);
	}
	&mut lists[index]
}

impl Runtime {
	fn anchor_state(&self, anchor: NodeId) -> Result<&AnchorState> {
		self.records
			.get(&anchor)
			.and_then(|record| record.anchor.as_ref())
			.ok_or(Error::MissingRepeat(anchor))
	}

	pub(crate) fn anchor_state_mut(&mut self, anchor: NodeId) -> Result<&mut AnchorState> {
		self.records
			.get_mut(&anchor)
			.and_then(|record| record.anchor.as_mut())
			.ok_or(Error::MissingRepeat(anchor))
	}

	/// Replaces a `@for` template with its anchor.
	pub(crate) fn define_for(&mut self, owner: InstanceId, template: NodeId, compiled: &CompiledHtml) -> Result<()> {
		let mut aliases = Vec::new();
		let mut keys = Vec::new();
		let mut values = Vec::new();
		let (mut min, mut min_default) = (None, None);
		for name in self.document.attribute_names(template) {
			let Some((kind, directive)) = compiled.lookup(&name) else { continue };
			match kind {
				DirectiveKind::For => aliases.push((name, directive.value.clone())),
				DirectiveKind::ForKey => keys.push(directive.value.clone()),
				DirectiveKind::ForValue => values.push(directive.value.clone()),
				DirectiveKind::ForMin => min = Some(directive.value.clone()),
				DirectiveKind::ForMinDefault => min_default = Some(directive.value.clone()),
				_ => (),
			}
		}
		if aliases.len() > 1 {
			return Err(Error::MultipleDirectives("for"));
		}
		if keys.len() > 1 {
			return Err(Error::MultipleDirectives("key"));
		}
		if values.len() > 1 {
			return Err(Error::MultipleDirectives("value"));
		}
		let (alias, condition) = aliases.pop().ok_or(Error::MissingRepeat(template))?;

		let anchor = self.document.create_element("a")?;
		self.document.set_attribute(anchor, ANCHOR_ATTRIBUTE, "1");
		self.document.set_attribute(anchor, ANCHOR_ALIAS_ATTRIBUTE, alias.as_str());
		self.record_mut(anchor).owner = Some(owner);
		self.document.remove_attribute(template, &alias);
		{
			let for_box = &mut self.record_mut(template).for_box;
			for_box.key_name = keys.pop();
			for_box.value_name = values.pop();
		}
		let paths = self.anchor_paths(owner, template)?;
		self.record_mut(template).for_box.anchors = paths;

		if self.is_injected(owner, template).is_none() {
			self.instance_mut(owner).for_nodes.push(template);
		} else if let Some(packs) = compiled.table(DirectiveKind::Pack) {
			if let Some((placeholder, _)) = packs.iter().find(|(placeholder, _)| self.document.has_attribute(template, placeholder)) {
				let placeholder = placeholder.clone();
				self.document.set_attribute(anchor, &placeholder, "");
			}
		}

		self.record_mut(anchor).anchor = Some(AnchorState::new(template));
		self.document.replace(template, anchor)?;
		self.record_mut(template).repeat = Some(Repeat {
			condition,
			anchors: vec![anchor],
			min,
			min_default,
		});
		trace!(?template, ?anchor, "Defined loop");
		Ok(())
	}

	/// Numbers the anchors nested in `template` and returns a selector path to each.
	fn anchor_paths(&mut self, owner: InstanceId, template: NodeId) -> Result<Vec<String>> {
		let anchors = self.document.query_selector_all(template, &format!("[{ANCHOR_ATTRIBUTE}]"))?;
		let mut paths = Vec::with_capacity(anchors.len());
		for (i, anchor) in anchors.into_iter().enumerate() {
			paths.push(format!("{}[{ANCHOR_ATTRIBUTE}=\"{i}\"]", self.build_path(anchor, template)));
			self.document.set_attribute(anchor, ANCHOR_ATTRIBUTE, i.to_string());
			if let Some(inner) = self.records.get(&anchor).and_then(|record| record.anchor.as_ref()).map(|state| state.template) {
				self.instance_mut(owner).for_nodes.retain(|&node| node != inner);
			}
		}
		Ok(paths)
	}

	/// Space-separated tag names from below `parent` down to `node`.
	fn build_path(&self, node: NodeId, parent: NodeId) -> String {
		let mut tags = Vec::new();
		let mut current = node;
		while current != parent {
			tags.push(self.document.tag_name(current).unwrap_or_default());
			match self.document.parent(current) {
				Some(next) => current = next,
				None => break,
			}
		}
		tags.iter().rev().map(|tag| format!(" {tag}")).collect()
	}

	/// Renders every live anchor of `template`.
	#[instrument(skip(self))]
	pub(crate) fn action_for(&mut self, owner: InstanceId, template: NodeId) -> Result<()> {
		let repeat = self
			.records
			.get(&template)
			.and_then(|record| record.repeat.clone())
			.ok_or(Error::MissingRepeat(template))?;
		let mut i = 0;
		loop {
			let anchors = match self.records.get(&template).and_then(|record| record.repeat.as_ref()) {
				Some(repeat) => &repeat.anchors,
				None => break,
			};
			let Some(&anchor) = anchors.get(i) else { break };
			let count = anchors.len();
			let live = self.document.parent(anchor).map_or(false, |parent| self.document.is_connected(parent));
			if !live {
				if count > 1 && self.is_in_if(anchor, false).is_none() {
					if let Some(repeat) = self.records.get_mut(&template).and_then(|record| record.repeat.as_mut()) {
						repeat.anchors.remove(i);
					}
				} else {
					i += 1;
				}
				continue;
			}

			let Some((keys, values)) = self.iteration(owner, anchor, &repeat)? else {
				error!("For doesn't have iterable value, removing node");
				self.document.remove(template);
				return Ok(());
			};
			self.render_for(owner, template, anchor, &keys, &values)?;
			i += 1;
		}
		Ok(())
	}

	/// Keys and values to render, or `None` if the expression isn't iterable.
	#[allow(clippy::cast_precision_loss)]
	fn iteration(&mut self, owner: InstanceId, anchor: NodeId, repeat: &Repeat) -> Result<Option<(Vec<Value>, Vec<Value>)>> {
		let mut result = self.execute(owner, anchor, &repeat.condition)?;
		if let Value::String(s) = &result {
			result = Value::Number(string_to_number(s));
		}
		let index_key = |i: usize| Value::string(i.to_string());
		let (mut keys, mut values, is_array): (Vec<Value>, Vec<Value>, bool) = match result {
			Value::Number(n) if n.is_nan() => return Ok(None),
			Value::Number(n) => {
				let len = array_length(n)?;
				((0..len).map(index_key).collect(), vec![Value::Null; len], true)
			}
			Value::Array(items) => ((0..items.len()).map(index_key).collect(), items.to_vec(), true),
			Value::Object(object) => (
				object.keys().map(|key| Value::String(key.clone())).collect(),
				object.iter().map(|(_, value)| value.clone()).collect(),
				false,
			),
			Value::Node(_) => (Vec::new(), Vec::new(), false),
			Value::Null => return Err(Error::Type("Cannot convert undefined or null to object".to_owned())),
			_ => return Ok(None),
		};

		if let Some(min) = &repeat.min {
			let Value::Number(min) = self.execute(owner, anchor, min)? else {
				return Err(Error::Type("For min must be a number".to_owned()));
			};
			if (values.len() as f64) < min {
				if !is_array {
					return Err(Error::Type("only arrays can be padded to a minimum length".to_owned()));
				}
				let padding = match &repeat.min_default {
					Some(source) => self.execute(owner, anchor, source)?,
					None => Value::Undefined,
				};
				let target = array_length(min)?;
				while values.len() < target {
					keys.push(index_key(values.len()));
					values.push(padding.clone());
				}
			}
		}
		Ok(Some((keys, values)))
	}

	fn render_for(&mut self, owner: InstanceId, template: NodeId, anchor: NodeId, keys: &[Value], values: &[Value]) -> Result<()> {
		let wanted = keys.len();
		if self.anchor_state(anchor)?.children.len() > wanted {
			let state = self.anchor_state_mut(anchor)?;
			let removed = state.children.split_off(wanted);
			state.for_generated.truncate(wanted);
			state.anchor_generated.truncate(wanted);
			trace!(removed = removed.len(), "Truncating");
			for clone in removed {
				self.remove_from_children(owner, clone)?;
			}
		}

		let (key_name, value_name, paths) = {
			let for_box = self.records.get(&template).map(|record| record.for_box.clone()).unwrap_or_default();
			(for_box.key_name, for_box.value_name, for_box.anchors)
		};
		let anchor_scope = self.records.get(&anchor).map(|record| record.scope.clone()).unwrap_or_default();

		// Recycle.
		let generated = self.anchor_state(anchor)?.for_generated.clone();
		for (nodes, (key, value)) in generated.iter().zip(keys.iter().zip(values)) {
			for &node in nodes {
				let node_owner = self.records.get(&node).and_then(|record| record.owner).unwrap_or(owner);
				if !self.instance(owner).unique_children.contains(&node) {
					self.tear_unique(node_owner, node);
					self.setup_unique(node_owner, node, true);
				}
				let uses = {
					let record = self.record_mut(node);
					merge_into(&mut record.scope, &anchor_scope);
					record.for_box.key = key.clone();
					record.for_box.value = value.clone();
					record.uses.clone()
				};
				if let Some((source, name)) = uses {
					{
						let for_box = &mut self.record_mut(node).for_box;
						for_box.key_name = key_name.clone();
						for_box.value_name = value_name.clone();
					}
					let used = self.execute(owner, node, &source)?;
					self.record_mut(node).scope.insert(name, used);
					self.action_item(node_owner, node);
				}
			}
		}
		let nested = self.anchor_state(anchor)?.anchor_generated.clone();
		for (subs, (key, value)) in nested.iter().zip(keys.iter().zip(values)) {
			for &sub in subs {
				{
					let scope = &mut self.record_mut(sub).scope;
					scope.insert(key_name.clone().unwrap_or_else(|| "$key".into()), key.clone());
					scope.insert(value_name.clone().unwrap_or_else(|| "$value".into()), value.clone());
				}
				let inner = self.anchor_state(sub)?.template;
				self.action_for(owner, inner)?;
			}
		}

		// Append.
		let class = self.instance(owner).class.clone();
		let compiled = class.compiled_html();
		let start = self.anchor_state(anchor)?.children.len();
		for i in start..wanted {
			let (key, value) = (keys[i].clone(), values[i].clone());
			let clone = self.document.clone_node(template, true)?;
			let mut generated = Vec::new();
			for node in self.assign_actions(owner, clone, true, compiled) {
				let record = self.record_mut(node);
				if record.for_box.is_item {
					continue;
				}
				record.for_box.is_item = true;
				record.for_box.key = key.clone();
				record.for_box.value = value.clone();
				record.for_box.key_name = key_name.clone();
				record.for_box.value_name = value_name.clone();
				let mut scope = anchor_scope.clone();
				merge_into(&mut scope, &record.scope);
				record.scope = scope;
				generated.push(node);
			}
			*ensure_slot(&mut self.anchor_state_mut(anchor)?.for_generated, i) = generated;

			let parent = self.document.parent(anchor).ok_or(Error::Hierarchy("loop anchor has no parent"))?;
			self.document.insert_before(parent, clone, Some(anchor))?;
			ensure_slot(&mut self.anchor_state_mut(anchor)?.anchor_generated, i).clear();

			for path in &paths {
				let found = self.document.query_selector(clone, path)?;
				let real = self.document.query_selector(template, path)?;
				let (Some(found), Some(real)) = (found, real) else {
					return Err(Error::AnchorNotFound(path.clone()));
				};
				let sub = self.reconstruct_for_anchor(found, real)?;
				let inner = {
					let state = self.anchor_state_mut(sub)?;
					state.children.clear();
					state.for_generated.clear();
					state.anchor_generated.clear();
					state.template
				};
				let mut scope = self.records.get(&inner).map(|record| record.scope.clone()).unwrap_or_default();
				merge_into(&mut scope, &anchor_scope);
				scope.insert(key_name.clone().unwrap_or_else(|| "$key".into()), key.clone());
				scope.insert(value_name.clone().unwrap_or_else(|| "$value".into()), value.clone());
				self.record_mut(sub).scope = scope;
				ensure_slot(&mut self.anchor_state_mut(anchor)?.anchor_generated, i).push(sub);
				self.action_for(owner, inner)?;
			}

			{
				let record = self.record_mut(clone);
				record.owner.get_or_insert(owner);
				record.clone_of = Some((anchor, i));
			}
			self.anchor_state_mut(anchor)?.children.push(clone);
			if self.has_light_dom(owner) {
				let injected = self.render_injected(owner, clone, Some((anchor, i)))?;
				ensure_slot(&mut self.anchor_state_mut(anchor)?.for_generated, i).extend(injected);
			}
		}

		// An anchor that is still the original element becomes a text node, so it doesn't show.
		if !self.document.is_text(anchor) {
			let text = self.reconstruct_for_anchor(anchor, anchor)?;
			if let Some((outer, index)) = self.records.get(&text).and_then(|record| record.for_box.inject_parent) {
				ensure_slot(&mut self.anchor_state_mut(outer)?.for_generated, index).push(text);
			}
		}
		Ok(())
	}

	/// Swaps the element anchor `old` for an empty text node carrying `real`'s state.
	///
	/// If `old` is `real`, the text node takes its place among the template's anchors. Otherwise it is added.
	fn reconstruct_for_anchor(&mut self, old: NodeId, real: NodeId) -> Result<NodeId> {
		let text = self.document.create_text("")?;
		self.document.replace(old, text)?;
		// A clone's copy of the anchor element has no other use.
		if old != real {
			self.records.remove(&old);
			self.document.free(old)?;
		}
		let record = self.records.get(&real).cloned().unwrap_or_default();
		let template = record.anchor.as_ref().map(|state| state.template).ok_or(Error::MissingRepeat(real))?;
		let children = record.anchor.as_ref().map(|state| state.children.clone()).unwrap_or_default();
		self.records.insert(text, record);

		let anchors = &mut self
			.records
			.get_mut(&template)
			.and_then(|record| record.repeat.as_mut())
			.ok_or(Error::MissingRepeat(template))?
			.anchors;
		if old == real {
			match anchors.iter().position(|&anchor| anchor == old) {
				Some(position) => anchors[position] = text,
				None => anchors.push(text),
			}
		} else {
			anchors.push(text);
		}

		for (i, child) in children.into_iter().enumerate() {
			if let Some(record) = self.records.get_mut(&child) {
				record.clone_of = Some((text, i));
			}
		}
		Ok(text)
	}

	/// Removes a loop clone, forgets every render child inside it and frees it.
	fn remove_from_children(&mut self, owner: InstanceId, clone: NodeId) -> Result<()> {
		let owner = self.records.get(&clone).and_then(|record| record.owner).unwrap_or(owner);
		let removed: Vec<NodeId> = self
			.instance(owner)
			.children
			.iter()
			.copied()
			.filter(|&child| self.document.contains(clone, child))
			.collect();
		let instance = self.instance_mut(owner);
		instance.children.retain(|child| !removed.contains(child));
		for child in &removed {
			instance.child_set.remove(child);
		}
		self.document.remove(clone);
		self.release(clone)
	}

	/// Frees `root` together with the `@if` stand-ins and hidden nodes paired with anything in it,
	/// retires the components hosted there and drops what the runtime kept about the freed nodes.
	#[instrument(skip(self))]
	pub(crate) fn release(&mut self, root: NodeId) -> Result<()> {
		let mut roots = vec![root];
		let mut freed = HashSet::new();
		while let Some(root) = roots.pop() {
			if !self.document.is_live(root) {
				continue;
			}
			for node in self.document.subtree(root) {
				if let Some(record) = self.records.get(&node) {
					let paired = |other: &NodeId, back: fn(&NodeRecord) -> Option<NodeId>| {
						self.records.get(other).and_then(back) == Some(node)
					};
					roots.extend(record.replacement.filter(|other| paired(other, |record| record.replacement_of)));
					roots.extend(record.replacement_of.filter(|other| paired(other, |record| record.replacement)));
				}
				if let Some(instance) = self.instance_of(node) {
					roots.extend(self.retire(instance));
				}
			}
			freed.extend(self.document.free(root)?);
		}
		trace!(freed = freed.len(), "Released");
		self.forget(&freed);
		Ok(())
	}

	fn forget(&mut self, freed: &HashSet<NodeId>) {
		for node in freed {
			self.listeners.remove(node);
			self.hosts.remove(node);
			let Some(record) = self.records.remove(node) else { continue };
			if let Some(template) = record.anchor.map(|state| state.template) {
				if let Some(repeat) = self.records.get_mut(&template).and_then(|record| record.repeat.as_mut()) {
					repeat.anchors.retain(|anchor| anchor != node);
				}
			}
		}
		let gone = |node: &NodeId| freed.contains(node);
		for instance in &mut self.instances {
			instance.children.retain(|node| !gone(node));
			instance.child_set.retain(|node| !gone(node));
			instance.unique_children.retain(|node| !gone(node));
			instance.unique_nodes.retain(|node| !gone(node));
			instance.for_nodes.retain(|node| !gone(node));
			instance.to_bind.retain(|(node, _)| !gone(node));
			instance.to_input.retain(|node, _| !gone(node));
			instance.gets.retain(|_, node| !gone(node));
			instance.binder.retain(|link| !matches!(&link.receiver, Receiver::Node(node, _) if gone(node)));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Lifecycle, Settings};
	use pretty_assertions::assert_eq;

	struct Plain;
	impl Lifecycle for Plain {}

	fn strings(items: &[&str]) -> Value {
		Value::array(items.iter().map(|&item| Value::from(item)))
	}

	#[test]
	fn array_lengths() {
		assert_eq!(array_length(3.0), Ok(3));
		assert_eq!(array_length(0.0), Ok(0));
		assert_eq!(array_length(4_294_967_295.0), Ok(4_294_967_295));
		assert!(array_length(4_294_967_296.0).is_err());
		assert!(array_length(1e12).is_err());
		assert!(array_length(-1.0).is_err());
		assert!(array_length(1.5).is_err());
		assert!(array_length(f64::INFINITY).is_err());
	}

	#[test]
	fn truncated_clones_are_freed() {
		let mut runtime = Runtime::new(Settings::new()).unwrap();
		runtime
			.register("x-list", r#"<ul><li @for="items" @e:click="picked = $value">{{ $value }}</li></ul>"#, "", || Box::new(Plain))
			.unwrap();
		let body = runtime.document().body();
		let host = runtime.mount(body, "<x-list></x-list>").unwrap()[0];
		let id = runtime.instance_of(host).unwrap();
		let cycle = |runtime: &mut Runtime| {
			for items in [&["a", "b", "c", "d"][..], &["a"]] {
				runtime.set_state(id, "items", strings(items)).unwrap();
				runtime.run_until_idle().unwrap();
			}
		};
		let sizes = |runtime: &Runtime| (runtime.document().len(), runtime.records.len(), runtime.listeners.len());

		cycle(&mut runtime);
		let settled = sizes(&runtime);
		for _ in 0..100 {
			cycle(&mut runtime);
		}
		assert_eq!(sizes(&runtime), settled);
		assert_eq!(runtime.document().text_content(host), "a");
		assert_eq!(runtime.instance(id).children.iter().filter(|&&node| !runtime.document().is_live(node)).count(), 0);
	}

	#[test]
	fn hosted_components_are_retired_with_their_clone() {
		let mut runtime = Runtime::new(Settings::new()).unwrap();
		runtime.register("x-list", r#"<x-item @for="items"><b>{{ $value }}</b></x-item>"#, "", || Box::new(Plain)).unwrap();
		runtime.register("x-item", "<i>{{ 1 }}</i>", "", || Box::new(Plain)).unwrap();
		let body = runtime.document().body();
		let host = runtime.mount(body, "<x-list></x-list>").unwrap()[0];
		let id = runtime.instance_of(host).unwrap();
		runtime.set_state(id, "items", strings(&["a", "b"])).unwrap();
		runtime.run_until_idle().unwrap();
		let items = runtime.document().elements_by_tag_name(host, "x-item");
		assert_eq!(items.len(), 2);
		let second = runtime.instance_of(items[1]).unwrap();

		runtime.set_state(id, "items", strings(&["a"])).unwrap();
		runtime.run_until_idle().unwrap();
		assert_eq!(runtime.document().elements_by_tag_name(host, "x-item"), vec![items[0]]);
		assert_eq!(runtime.instance_of(items[1]), None);
		assert!(runtime.instance(second).children.is_empty());
		assert!(!runtime.document().is_live(items[1]));
		assert!(runtime.is_ready());
	}
}
