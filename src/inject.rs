//! `<dito-inject>`: copying a host's original light DOM into its rendered template.

use crate::{
	binder::{PACK_ATTRIBUTE, USE_NAME_ATTRIBUTE},
	compiler::DirectiveKind,
	dom::NodeId,
	reconcile::{AnchorState, ANCHOR_ALIAS_ATTRIBUTE},
	runtime::{InstanceId, Runtime},
	value::Value,
	Error, Result,
};
use std::rc::Rc;
use tracing::{instrument, trace};

pub(crate) const INJECT_TAG: &str = "dito-inject";

impl Runtime {
	pub(crate) fn has_light_dom(&self, id: InstanceId) -> bool {
		self.instance(id).injected.as_ref().map_or(false, |light| !light.is_empty())
	}

	/// Replaces each `<dito-inject>` below `root` with copies of `injector`'s light DOM and returns the copied nodes.
	///
	/// A marker with `@pack` only takes the light DOM templates whose own `@pack` evaluates loosely equal to it.
	#[instrument(skip(self))]
	pub(crate) fn render_injected(&mut self, injector: InstanceId, root: NodeId, for_anchor: Option<(NodeId, usize)>) -> Result<Vec<NodeId>> {
		let mut rendered = Vec::new();
		for marker in self.document.elements_by_tag_name(root, INJECT_TAG) {
			if self.is_injected(injector, marker).is_some() {
				continue;
			}
			let record = self.records.get(&marker).cloned().unwrap_or_default();
			let use_source = match record.directives(DirectiveKind::Use) {
				[] => None,
				[directive] => Some(directive.value.clone()),
				_ => return Err(Error::MultipleDirectives("use")),
			};
			let used = match &use_source {
				Some(source) => Some(self.execute(injector, marker, source)?),
				None => None,
			};
			let templates = self.instance(injector).injected.clone().unwrap_or_default();
			let packs = record.directives(DirectiveKind::Pack);

			if packs.is_empty() {
				for &template in &templates {
					rendered.extend(self.init_injected(injector, marker, template, used.as_ref(), use_source.as_ref(), for_anchor)?);
				}
			}
			for pack in packs {
				let wanted = self.execute(injector, marker, &pack.value)?;
				for &template in &templates {
					let Some(expression) = self.document.get_attribute(template, PACK_ATTRIBUTE).filter(|e| !e.is_empty()).map(Rc::<str>::from) else {
						continue;
					};
					let template_owner = self.records.get(&template).and_then(|record| record.owner).unwrap_or(injector);
					if !wanted.loose_eq(&self.execute(template_owner, template, &expression)?) {
						continue;
					}
					rendered.extend(self.init_injected(injector, marker, template, used.as_ref(), use_source.as_ref(), for_anchor)?);
				}
			}
			self.document.remove(marker);
		}
		Ok(rendered)
	}

	/// Inserts a copy of one light DOM template before `marker`, carrying over the template's node records.
	fn init_injected(
		&mut self,
		injector: InstanceId,
		marker: NodeId,
		template: NodeId,
		used: Option<&Value>,
		use_source: Option<&Rc<str>>,
		for_anchor: Option<(NodeId, usize)>,
	) -> Result<Vec<NodeId>> {
		let use_name: Rc<str> = self.document.get_attribute(template, USE_NAME_ATTRIBUTE).unwrap_or("use").into();
		let scope = used.filter(|value| value.is_truthy()).map(|value| (use_name.clone(), value.clone()));

		let pairs = self.document.clone_subtree(template)?;
		let &(_, root) = pairs.first().ok_or(Error::Hierarchy("injected node wasn't cloned"))?;
		let mut rendered = Vec::new();
		let mut loops = Vec::new();
		let mut to_upgrade = Vec::new();
		for (original, node) in pairs {
			self.document.remove_attribute(node, USE_NAME_ATTRIBUTE);
			if let Some(instance) = self.instance_of(original) {
				if !self.instance(instance).rendered {
					self.pending_first_renders.remove(&instance);
				}
			}
			let Some(mut record) = self.records.get(&original).cloned() else {
				if self.is_component_element(node) {
					to_upgrade.push((node, None));
				}
				continue;
			};
			let Some(owner) = record.owner else { continue };
			if self.is_component_element(node) {
				to_upgrade.push((node, Some(owner)));
			}

			record.injected_parent = Some(injector);
			record.listeners.clear();
			if record.uses.is_none() {
				record.uses = use_source.map(|source| (source.clone(), use_name.clone()));
			}
			if let Some((anchor, index)) = record.clone_of {
				if let Some(slot) = self.anchor_state_mut(anchor).ok().and_then(|state| state.children.get_mut(index)) {
					*slot = node;
				}
			}
			if let Some(hidden) = record.replacement_of {
				if let Some(hidden) = self.records.get_mut(&hidden) {
					hidden.replacement = Some(node);
				}
			}
			if let Some((name, value)) = &scope {
				record.scope.insert(name.clone(), value.clone());
			}
			if let Some(state) = record.anchor.as_mut() {
				let inner = state.template;
				*state = AnchorState::new(inner);
				record.for_box.inject_parent = for_anchor;
				if let Some(repeat) = self.records.get_mut(&inner).and_then(|inner| inner.repeat.as_mut()) {
					repeat.anchors.push(node);
				}
				let for_nodes = &mut self.instance_mut(owner).for_nodes;
				if !for_nodes.contains(&inner) {
					for_nodes.push(inner);
				}
				loops.push((owner, inner));
			}
			self.records.insert(node, record);
			self.push_child(owner, node);
			self.queue_render(owner);
			rendered.push(node);
		}

		let parent = self.document.parent(marker).ok_or(Error::Hierarchy("injection marker has no parent"))?;
		self.document.insert_before(parent, root, Some(marker))?;
		trace!(?template, ?root, "Injected");
		for (owner, inner) in loops {
			self.action_for(owner, inner)?;
		}
		for (node, parent) in to_upgrade {
			if self.instance_of(node).is_none() {
				self.upgrade(node, parent)?;
			}
		}
		self.action_items(root, injector, for_anchor.is_some());
		Ok(rendered)
	}

	/// Applies the actions of every recorded node below `root`, skipping nested light DOM.
	pub(crate) fn action_items(&mut self, root: NodeId, scope: InstanceId, in_loop: bool) {
		let mut stack = vec![root];
		while let Some(node) = stack.pop() {
			if let Some(record) = self.records.get(&node) {
				if let Some(owner) = record.owner {
					if !in_loop && self.is_injected(scope, node).is_some() {
						continue;
					}
					if !record.for_box.is_item && !self.document.has_attribute(node, ANCHOR_ALIAS_ATTRIBUTE) {
						self.push_child(owner, node);
					}
					self.setup_unique(owner, node, false);
					self.action_item(owner, node);
					self.instance_mut(owner).unique_children.retain(|&unique| unique != node);
				}
			}
			stack.extend(self.document.children(node).iter().rev().copied());
		}
	}
}
