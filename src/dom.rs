//! An arena-backed document tree.
//!
//! Nodes are addressed by [`NodeId`]s handed out by a single [`Document`].
//! Detached subtrees can be [freed](`Document::free`), after which their slots are recycled under a new generation.
//! A freed id reads as an empty detached comment and is refused by every tree edit.

use crate::{html, selector::Selector, Error, Result};
use core::fmt::{self, Debug, Formatter};
use hashbrown::HashSet;
use tracing::{instrument, trace};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
	index: u32,
	generation: u32,
}
impl NodeId {
	fn index(self) -> usize {
		self.index as usize
	}
}
impl Debug for NodeId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.generation {
			0 => write!(f, "#{}", self.index),
			generation => write!(f, "#{}v{}", self.index, generation),
		}
	}
}

#[derive(Debug, Clone)]
pub enum NodeData {
	Element(Element),
	Text(String),
	Comment(String),
}

#[derive(Debug, Clone, Default)]
pub struct Element {
	name: String,
	attributes: Vec<(String, String)>,
	/// Live element properties (like a form field's `value`) that aren't reflected as attributes.
	properties: Vec<(String, String)>,
}
impl Element {
	fn new(name: &str) -> Self {
		Self {
			name: name.to_ascii_lowercase(),
			..Self::default()
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn attributes(&self) -> &[(String, String)] {
		&self.attributes
	}
}

#[derive(Debug, Clone)]
struct Slot {
	generation: u32,
	data: NodeData,
	parent: Option<NodeId>,
	children: Vec<NodeId>,
}
impl Slot {
	fn new(generation: u32, data: NodeData) -> Self {
		Self {
			generation,
			data,
			parent: None,
			children: Vec::new(),
		}
	}
}

/// An attribute change on an [observed](`Document::observe`) element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
	pub target: NodeId,
	pub attribute: String,
	pub old_value: Option<String>,
}

/// Tags of elements that never have content.
pub(crate) const VOID_ELEMENTS: &[&str] = &[
	"area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

/// Tags that expose a `value` property before it's ever assigned.
const VALUE_ELEMENTS: &[&str] = &["input", "textarea", "select", "option", "button"];

#[derive(Debug)]
pub struct Document {
	slots: Vec<Slot>,
	/// Indices of freed slots, reused before the arena grows.
	free: Vec<u32>,
	/// Slots that ran out of generations and are never handed out again.
	retired: usize,
	/// What freed ids resolve to.
	vacant: Slot,
	body: NodeId,
	observed: HashSet<NodeId>,
	mutations: Vec<MutationRecord>,
}

impl Default for Document {
	fn default() -> Self {
		Self::new()
	}
}

impl Document {
	#[must_use]
	pub fn new() -> Self {
		Self {
			slots: vec![Slot::new(0, NodeData::Element(Element::new("body")))],
			free: Vec::new(),
			retired: 0,
			vacant: Slot::new(0, NodeData::Comment(String::new())),
			body: NodeId { index: 0, generation: 0 },
			observed: HashSet::new(),
			mutations: Vec::new(),
		}
	}

	fn push(&mut self, data: NodeData) -> Result<NodeId> {
		if let Some(index) = self.free.pop() {
			let slot = &mut self.slots[index as usize];
			slot.data = data;
			return Ok(NodeId {
				index,
				generation: slot.generation,
			});
		}
		let index = u32::try_from(self.slots.len()).map_err(|_| Error::ArenaFull)?;
		self.slots.push(Slot::new(0, data));
		Ok(NodeId { index, generation: 0 })
	}

	/// Whether `id` still refers to the node it was handed out for.
	#[must_use]
	pub fn is_live(&self, id: NodeId) -> bool {
		self.slots.get(id.index()).map_or(false, |slot| slot.generation == id.generation)
	}

	fn slot(&self, id: NodeId) -> &Slot {
		match self.slots.get(id.index()) {
			Some(slot) if slot.generation == id.generation => slot,
			_ => &self.vacant,
		}
	}

	fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
		self.slots.get_mut(id.index()).filter(|slot| slot.generation == id.generation)
	}

	fn live(&self, id: NodeId) -> Result<()> {
		if self.is_live(id) {
			Ok(())
		} else {
			Err(Error::Freed(id))
		}
	}

	/// The root all connected nodes descend from.
	#[must_use]
	pub fn body(&self) -> NodeId {
		self.body
	}

	/// The number of live nodes, attached or not.
	#[must_use]
	pub fn len(&self) -> usize {
		self.slots.len() - self.free.len() - self.retired
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// # Errors
	///
	/// [`Error::ArenaFull`] once every [`NodeId`] is taken.
	pub fn create_element(&mut self, name: &str) -> Result<NodeId> {
		self.push(NodeData::Element(Element::new(name)))
	}

	/// # Errors
	///
	/// [`Error::ArenaFull`] once every [`NodeId`] is taken.
	pub fn create_text(&mut self, data: impl Into<String>) -> Result<NodeId> {
		self.push(NodeData::Text(data.into()))
	}

	/// # Errors
	///
	/// [`Error::ArenaFull`] once every [`NodeId`] is taken.
	pub fn create_comment(&mut self, data: impl Into<String>) -> Result<NodeId> {
		self.push(NodeData::Comment(data.into()))
	}

	/// Detaches `root` and releases it and all of its descendants, returning the released ids in document order.
	///
	/// The ids become stale: they resolve to an empty detached comment until their slots are reused,
	/// and tree edits involving them fail with [`Error::Freed`].
	///
	/// # Errors
	///
	/// The body can't be freed.
	#[instrument(skip(self))]
	pub fn free(&mut self, root: NodeId) -> Result<Vec<NodeId>> {
		if root == self.body {
			return Err(Error::Hierarchy("the body can't be freed"));
		}
		if !self.is_live(root) {
			return Ok(Vec::new());
		}
		self.detach(root);
		let freed = self.subtree(root);
		for &id in &freed {
			self.observed.remove(&id);
			let slot = &mut self.slots[id.index()];
			*slot = Slot::new(id.generation.saturating_add(1), NodeData::Comment(String::new()));
			if slot.generation < u32::MAX {
				self.free.push(id.index);
			} else {
				self.retired += 1;
			}
		}
		trace!("Freed {} nodes", freed.len());
		Ok(freed)
	}

	#[must_use]
	pub fn data(&self, id: NodeId) -> &NodeData {
		&self.slot(id).data
	}

	#[must_use]
	pub fn element(&self, id: NodeId) -> Option<&Element> {
		match &self.slot(id).data {
			NodeData::Element(element) => Some(element),
			_ => None,
		}
	}

	fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
		match &mut self.slot_mut(id)?.data {
			NodeData::Element(element) => Some(element),
			_ => None,
		}
	}

	#[must_use]
	pub fn is_element(&self, id: NodeId) -> bool {
		self.element(id).is_some()
	}

	#[must_use]
	pub fn is_text(&self, id: NodeId) -> bool {
		matches!(self.slot(id).data, NodeData::Text(_))
	}

	/// The lower-case tag name, for elements.
	#[must_use]
	pub fn tag_name(&self, id: NodeId) -> Option<&str> {
		self.element(id).map(Element::name)
	}

	#[must_use]
	pub fn parent(&self, id: NodeId) -> Option<NodeId> {
		self.slot(id).parent
	}

	#[must_use]
	pub fn children(&self, id: NodeId) -> &[NodeId] {
		&self.slot(id).children
	}

	pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
		self.children(id).iter().copied().filter(move |&child| self.is_element(child))
	}

	/// The position of `id` among its parent's element children.
	#[must_use]
	pub fn element_index(&self, id: NodeId) -> Option<usize> {
		let parent = self.parent(id)?;
		self.element_children(parent).position(|child| child == id)
	}

	/// Whether `node` is `ancestor` or one of its descendants.
	#[must_use]
	pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
		let mut current = Some(node);
		while let Some(id) = current {
			if id == ancestor {
				return true;
			}
			current = self.parent(id);
		}
		false
	}

	#[must_use]
	pub fn is_connected(&self, id: NodeId) -> bool {
		self.contains(self.body, id)
	}

	/// Descendants of `root` in document order, excluding `root`.
	#[must_use]
	pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
		let mut found = Vec::new();
		let mut stack: Vec<NodeId> = self.children(root).iter().rev().copied().collect();
		while let Some(id) = stack.pop() {
			found.push(id);
			stack.extend(self.children(id).iter().rev().copied());
		}
		found
	}

	/// `root` followed by its descendants in document order.
	#[must_use]
	pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
		let mut nodes = vec![root];
		nodes.extend(self.descendants(root));
		nodes
	}

	#[must_use]
	pub fn elements_by_tag_name(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
		self.descendants(root).into_iter().filter(|&id| self.tag_name(id) == Some(tag)).collect()
	}

	fn detach(&mut self, id: NodeId) {
		if let Some(parent) = self.slot_mut(id).and_then(|slot| slot.parent.take()) {
			if let Some(parent) = self.slot_mut(parent) {
				parent.children.retain(|&child| child != id);
			}
		}
	}

	pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
		self.insert_before(parent, child, None)
	}

	/// Moves `child` (from wherever it currently is) into `parent`, before `reference` or at the end.
	pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> Result<()> {
		self.live(parent)?;
		self.live(child)?;
		if !self.is_element(parent) {
			return Err(Error::Hierarchy("only elements can have children"));
		}
		if self.contains(child, parent) {
			return Err(Error::Hierarchy("the new child is an ancestor of the parent"));
		}
		if let Some(reference) = reference {
			if self.parent(reference) != Some(parent) {
				return Err(Error::NotAChild(reference));
			}
		}
		let reference = match reference {
			Some(reference) if reference == child => {
				let siblings = self.children(parent);
				siblings.iter().position(|&id| id == child).and_then(|i| siblings.get(i + 1)).copied()
			}
			other => other,
		};

		self.detach(child);
		let children = &mut self.slot_mut(parent).ok_or(Error::Freed(parent))?.children;
		let index = reference.and_then(|reference| children.iter().position(|&id| id == reference)).unwrap_or(children.len());
		children.insert(index, child);
		self.slot_mut(child).ok_or(Error::Freed(child))?.parent = Some(parent);
		Ok(())
	}

	/// Inserts `new` where `old` is and detaches `old`.
	pub fn replace(&mut self, old: NodeId, new: NodeId) -> Result<()> {
		let parent = self.parent(old).ok_or(Error::Hierarchy("the replaced node has no parent"))?;
		if old == new {
			return Ok(());
		}
		self.insert_before(parent, new, Some(old))?;
		self.detach(old);
		Ok(())
	}

	/// Detaches `id` from its parent, if any. The node and its subtree stay usable.
	pub fn remove(&mut self, id: NodeId) {
		self.detach(id);
	}

	pub fn remove_children(&mut self, id: NodeId) {
		let children = self.slot_mut(id).map(|slot| core::mem::take(&mut slot.children)).unwrap_or_default();
		for child in children {
			if let Some(child) = self.slot_mut(child) {
				child.parent = None;
			}
		}
	}

	#[must_use]
	pub fn get_attribute(&self, id: NodeId, name: &str) -> Option<&str> {
		self.element(id)?.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	#[must_use]
	pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
		self.get_attribute(id, name).is_some()
	}

	#[must_use]
	pub fn attribute_names(&self, id: NodeId) -> Vec<String> {
		self.element(id).map_or_else(Vec::new, |element| element.attributes.iter().map(|(n, _)| n.clone()).collect())
	}

	/// Sets an attribute on an element. Other nodes ignore this, like `setAttribute` is absent on them.
	pub fn set_attribute(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
		let name = name.to_ascii_lowercase();
		let value = value.into();
		let observed = self.observed.contains(&id);
		let element = match self.element_mut(id) {
			Some(element) => element,
			None => return trace!("Ignored attribute `{}` on non-element {:?}", name, id),
		};
		let old_value = match element.attributes.iter_mut().find(|(n, _)| *n == name) {
			Some((_, slot)) => Some(core::mem::replace(slot, value)),
			None => {
				element.attributes.push((name.clone(), value));
				None
			}
		};
		if observed {
			self.mutations.push(MutationRecord {
				target: id,
				attribute: name,
				old_value,
			});
		}
	}

	pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Option<String> {
		let observed = self.observed.contains(&id);
		let element = self.element_mut(id)?;
		let index = element.attributes.iter().position(|(n, _)| n == name)?;
		let (name, old_value) = element.attributes.remove(index);
		if observed {
			self.mutations.push(MutationRecord {
				target: id,
				attribute: name,
				old_value: Some(old_value.clone()),
			});
		}
		Some(old_value)
	}

	/// Whether the element has a live property `name`, either assigned or built in (like an `<input>`'s `value`).
	#[must_use]
	pub fn has_property(&self, id: NodeId, name: &str) -> bool {
		self.element(id).map_or(false, |element| {
			element.properties.iter().any(|(n, _)| n == name) || (name == "value" && VALUE_ELEMENTS.contains(&element.name.as_str()))
		})
	}

	#[must_use]
	pub fn property(&self, id: NodeId, name: &str) -> Option<String> {
		let element = self.element(id)?;
		if let Some((_, value)) = element.properties.iter().find(|(n, _)| n == name) {
			return Some(value.clone());
		}
		if self.has_property(id, name) {
			return Some(self.get_attribute(id, name).unwrap_or_default().to_owned());
		}
		None
	}

	/// Sets a live property. Unlike attributes, this never produces a [`MutationRecord`].
	pub fn set_property(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
		let value = value.into();
		if let Some(element) = self.element_mut(id) {
			match element.properties.iter_mut().find(|(n, _)| n == name) {
				Some((_, slot)) => *slot = value,
				None => element.properties.push((name.to_owned(), value)),
			}
		}
	}

	/// The character data of a text or comment node.
	#[must_use]
	pub fn text(&self, id: NodeId) -> Option<&str> {
		match &self.slot(id).data {
			NodeData::Text(data) | NodeData::Comment(data) => Some(data),
			NodeData::Element(_) => None,
		}
	}

	pub fn set_text(&mut self, id: NodeId, data: impl Into<String>) {
		match self.slot_mut(id).map(|slot| &mut slot.data) {
			Some(NodeData::Text(slot) | NodeData::Comment(slot)) => *slot = data.into(),
			Some(NodeData::Element(_)) => trace!("Ignored character data on element {:?}", id),
			None => trace!("Ignored character data on freed node {:?}", id),
		}
	}

	/// Concatenated text of all descendant text nodes.
	#[must_use]
	pub fn text_content(&self, id: NodeId) -> String {
		match &self.slot(id).data {
			NodeData::Text(data) | NodeData::Comment(data) => data.clone(),
			NodeData::Element(_) => self.descendants(id).into_iter().filter_map(|id| match &self.slot(id).data {
				NodeData::Text(data) => Some(data.as_str()),
				_ => None,
			}).collect(),
		}
	}

	/// A detached copy of `id`, including its subtree if `deep`. Properties are not copied.
	///
	/// # Errors
	///
	/// [`Error::ArenaFull`] once every [`NodeId`] is taken.
	pub fn clone_node(&mut self, id: NodeId, deep: bool) -> Result<NodeId> {
		if deep {
			Ok(self.clone_subtree(id)?.first().map_or(id, |&(_, clone)| clone))
		} else {
			self.clone_shallow(id)
		}
	}

	fn clone_shallow(&mut self, id: NodeId) -> Result<NodeId> {
		let data = match &self.slot(id).data {
			NodeData::Element(element) => NodeData::Element(Element {
				name: element.name.clone(),
				attributes: element.attributes.clone(),
				properties: Vec::new(),
			}),
			other => other.clone(),
		};
		self.push(data)
	}

	/// Deeply clones `root` and returns `(original, clone)` pairs in document order, starting with the root.
	///
	/// # Errors
	///
	/// [`Error::ArenaFull`] once every [`NodeId`] is taken.
	pub fn clone_subtree(&mut self, root: NodeId) -> Result<Vec<(NodeId, NodeId)>> {
		let mut pairs = Vec::new();
		let mut stack = vec![(root, None)];
		while let Some((original, parent)) = stack.pop() {
			let clone = self.clone_shallow(original)?;
			if let Some(parent) = parent {
				self.append_child(parent, clone)?;
			}
			pairs.push((original, clone));
			stack.extend(self.children(original).iter().rev().map(|&child| (child, Some(clone))));
		}
		Ok(pairs)
	}

	/// Replaces the children of `id` with the parsed `html`.
	#[instrument(skip(self, html))]
	pub fn set_inner_html(&mut self, id: NodeId, html: &str) -> Result<Vec<NodeId>> {
		self.remove_children(id);
		self.append_html(id, html)
	}

	/// Parses `html` and appends the resulting nodes to `parent`, returning the new top-level nodes.
	pub fn append_html(&mut self, parent: NodeId, html: &str) -> Result<Vec<NodeId>> {
		let nodes = html::parse_fragment(self, html)?;
		for &node in &nodes {
			self.append_child(parent, node)?;
		}
		Ok(nodes)
	}

	#[must_use]
	pub fn inner_html(&self, id: NodeId) -> String {
		let mut html = String::new();
		for &child in self.children(id) {
			html::serialize(self, child, &mut html);
		}
		html
	}

	#[must_use]
	pub fn outer_html(&self, id: NodeId) -> String {
		let mut html = String::new();
		html::serialize(self, id, &mut html);
		html
	}

	/// The first descendant of `root` matching `selector`. Like the DOM method, `root` itself is never a match,
	/// but ancestors of `root` may satisfy the outer parts of a compound selector.
	pub fn query_selector(&self, root: NodeId, selector: &str) -> Result<Option<NodeId>> {
		let selector = Selector::parse(selector)?;
		Ok(self.descendants(root).into_iter().find(|&id| selector.matches(self, id)))
	}

	pub fn query_selector_all(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>> {
		let selector = Selector::parse(selector)?;
		Ok(self.descendants(root).into_iter().filter(|&id| selector.matches(self, id)).collect())
	}

	/// Starts recording attribute changes on `id`, like a `MutationObserver` with `attributes: true`.
	pub fn observe(&mut self, id: NodeId) {
		self.observed.insert(id);
	}

	pub fn unobserve(&mut self, id: NodeId) {
		self.observed.remove(&id);
	}

	#[must_use]
	pub fn is_observed(&self, id: NodeId) -> bool {
		self.observed.contains(&id)
	}

	/// Drains pending [`MutationRecord`]s in the order they occurred.
	pub fn take_mutations(&mut self) -> Vec<MutationRecord> {
		core::mem::take(&mut self.mutations)
	}

	#[must_use]
	pub fn has_pending_mutations(&self) -> bool {
		!self.mutations.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_replace_remove() {
		let mut doc = Document::new();
		let body = doc.body();
		let a = doc.create_element("a").unwrap();
		let b = doc.create_text("b").unwrap();
		doc.append_child(body, a).unwrap();
		doc.insert_before(body, b, Some(a)).unwrap();
		assert_eq!(doc.children(body), &[b, a]);

		let c = doc.create_comment("c").unwrap();
		doc.replace(b, c).unwrap();
		assert_eq!(doc.children(body), &[c, a]);
		assert!(!doc.is_connected(b));

		doc.remove(a);
		assert_eq!(doc.children(body), &[c]);
		assert_eq!(doc.parent(a), None);
	}

	#[test]
	fn no_cycles() {
		let mut doc = Document::new();
		let a = doc.create_element("div").unwrap();
		let b = doc.create_element("div").unwrap();
		doc.append_child(a, b).unwrap();
		assert!(doc.append_child(b, a).is_err());
	}

	#[test]
	fn clones_are_detached_and_deep() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, r#"<p class="x">a<b>c</b></p>"#).unwrap();
		let p = doc.children(body)[0];
		let copy = doc.clone_node(p, true).unwrap();
		assert_eq!(doc.parent(copy), None);
		assert_eq!(doc.outer_html(copy), r#"<p class="x">a<b>c</b></p>"#);
		assert_ne!(doc.children(copy)[1], doc.children(p)[1]);
	}

	#[test]
	fn attribute_mutations_are_recorded_when_observed() {
		let mut doc = Document::new();
		let input = doc.create_element("input").unwrap();
		doc.set_attribute(input, "value", "a");
		doc.observe(input);
		doc.set_attribute(input, "value", "b");
		doc.set_property(input, "value", "c");
		assert_eq!(
			doc.take_mutations(),
			vec![MutationRecord {
				target: input,
				attribute: "value".to_owned(),
				old_value: Some("a".to_owned()),
			}]
		);
		assert_eq!(doc.property(input, "value").as_deref(), Some("c"));
	}

	#[test]
	fn value_property_falls_back_to_attribute() {
		let mut doc = Document::new();
		let input = doc.create_element("input").unwrap();
		assert!(doc.has_property(input, "value"));
		assert_eq!(doc.property(input, "value").as_deref(), Some(""));
		doc.set_attribute(input, "value", "x");
		assert_eq!(doc.property(input, "value").as_deref(), Some("x"));
		let div = doc.create_element("div").unwrap();
		assert!(!doc.has_property(div, "value"));
	}

	#[test]
	fn freed_slots_are_reused_under_a_new_generation() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, "<ul><li>a</li><li>b</li></ul>").unwrap();
		let ul = doc.children(body)[0];
		let li = doc.children(ul)[0];
		let live = doc.len();

		let freed = doc.free(ul).unwrap();
		assert_eq!(freed.len(), 5);
		assert_eq!(doc.len(), live - 5);
		assert!(doc.children(body).is_empty());
		assert!(!doc.is_live(li));
		assert_eq!(doc.tag_name(li), None);
		assert_eq!(doc.append_child(body, li), Err(Error::Freed(li)));

		let reused = doc.create_element("p").unwrap();
		assert!(freed.iter().any(|id| id.index() == reused.index()));
		assert!(!freed.contains(&reused));
		assert_eq!(doc.tag_name(reused), Some("p"));
		assert_eq!(doc.len(), live - 4);
		assert!(doc.free(body).is_err());
	}
}
