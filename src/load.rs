//! Moving content between a live browser DOM and a [`Document`].

use crate::dom::{Document, NodeData, NodeId};
use tracing::{error, instrument};
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{Attr, Comment, Element, NamedNodeMap, Node as wNode, NodeList, Text};

/// Appends copies of `child_nodes` to `parent` and returns them.
///
/// # Errors
///
/// Iff `parent` can't have children.
pub fn load_child_nodes(document: &mut Document, parent: NodeId, child_nodes: &NodeList) -> crate::Result<Vec<NodeId>> {
	let mut loaded = Vec::with_capacity(child_nodes.length() as usize);
	for i in 0..child_nodes.length() {
		let Some(child) = child_nodes.item(i) else { continue };
		let node = if let Some(element) = child.dyn_ref::<Element>() {
			load_element(document, element)?
		} else if let Some(text) = child.dyn_ref::<Text>() {
			document.create_text(text.data())?
		} else if let Some(comment) = child.dyn_ref::<Comment>() {
			document.create_comment(comment.data())?
		} else {
			error!("Unrecognised child node: {:?}", child);
			continue;
		};
		document.append_child(parent, node)?;
		loaded.push(node);
	}
	Ok(loaded)
}

pub fn load_element(document: &mut Document, element: &Element) -> crate::Result<NodeId> {
	let node = document.create_element(&element.local_name())?;
	load_attributes(document, node, &element.attributes());
	let dom_node: &wNode = element.as_ref();
	load_child_nodes(document, node, &dom_node.child_nodes())?;
	Ok(node)
}

pub fn load_attributes(document: &mut Document, node: NodeId, attributes: &NamedNodeMap) {
	for i in 0..attributes.length() {
		if let Some(attribute) = attributes.item(i) {
			load_attribute(document, node, &attribute);
		}
	}
}

pub fn load_attribute(document: &mut Document, node: NodeId, attribute: &Attr) {
	document.set_attribute(node, &attribute.local_name(), attribute.value());
}

/// Creates live nodes for `node` and its subtree, owned by `target`.
///
/// # Errors
///
/// Whatever the browser throws, e.g. for an invalid attribute name.
#[instrument(skip(document, target))]
pub fn materialize(document: &Document, node: NodeId, target: &web_sys::Document) -> Result<wNode, JsValue> {
	let live: wNode = match document.data(node) {
		NodeData::Element(element) => {
			let live = target.create_element(element.name())?;
			for (name, value) in element.attributes() {
				live.set_attribute(name, value)?;
			}
			live.into()
		}
		NodeData::Text(text) => target.create_text_node(text).into(),
		NodeData::Comment(comment) => target.create_comment(comment).into(),
	};
	for &child in document.children(node) {
		live.append_child(&materialize(document, child, target)?)?;
	}
	Ok(live)
}

/// Replaces the children of `element` with live copies of `node`'s children.
pub fn materialize_children(document: &Document, node: NodeId, element: &Element) -> Result<(), JsValue> {
	let target = element.owner_document().ok_or_else(|| JsValue::from_str("element has no owner document"))?;
	element.set_inner_html("");
	for &child in document.children(node) {
		element.append_child(&materialize(document, child, &target)?)?;
	}
	Ok(())
}
