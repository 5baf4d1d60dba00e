//! HTML fragment parsing for `innerHTML`-style access, and the matching serializer.
//!
//! Parsing is delegated to [`scraper`] (and through it, `html5ever`), so fragments are tree-built like a browser would,
//! in the context of a `<body>`. The parsed tree is then copied into the arena.

use crate::{
	dom::{Document, NodeData, NodeId, VOID_ELEMENTS},
	Result,
};
use scraper::{ElementRef, Html, Node};
use tracing::trace;

/// Parses `html` into detached nodes and returns the top-level ones in order.
pub(crate) fn parse_fragment(document: &mut Document, html: &str) -> Result<Vec<NodeId>> {
	let fragment = Html::parse_fragment(html);
	for error in &fragment.errors {
		trace!("Recovered from HTML parse error: {}", error);
	}
	copy_children(document, fragment.root_element())
}

fn copy_children(document: &mut Document, parent: ElementRef<'_>) -> Result<Vec<NodeId>> {
	let mut nodes = Vec::new();
	for child in parent.children() {
		let node = match child.value() {
			Node::Text(text) => document.create_text(&**text)?,
			Node::Comment(comment) => document.create_comment(&**comment)?,
			Node::Element(_) => match ElementRef::wrap(child) {
				Some(element) => copy_element(document, element)?,
				None => continue,
			},
			_ => continue,
		};
		nodes.push(node);
	}
	Ok(nodes)
}

fn copy_element(document: &mut Document, element: ElementRef<'_>) -> Result<NodeId> {
	let node = document.create_element(element.value().name())?;
	for (name, value) in element.value().attrs() {
		document.set_attribute(node, name, value);
	}
	for child in copy_children(document, element)? {
		document.append_child(node, child)?;
	}
	Ok(node)
}

pub(crate) fn escape_text(text: &str, out: &mut String) {
	for c in text.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'\u{a0}' => out.push_str("&nbsp;"),
			c => out.push(c),
		}
	}
}

pub(crate) fn escape_attribute(value: &str, out: &mut String) {
	for c in value.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'"' => out.push_str("&quot;"),
			'\u{a0}' => out.push_str("&nbsp;"),
			c => out.push(c),
		}
	}
}

pub(crate) fn serialize(document: &Document, id: NodeId, out: &mut String) {
	match document.data(id) {
		NodeData::Text(text) => match document.parent(id).and_then(|parent| document.tag_name(parent)) {
			Some("script" | "style") => out.push_str(text),
			_ => escape_text(text, out),
		},
		NodeData::Comment(comment) => {
			out.push_str("<!--");
			out.push_str(comment);
			out.push_str("-->");
		}
		NodeData::Element(element) => {
			out.push('<');
			out.push_str(element.name());
			for (name, value) in element.attributes() {
				out.push(' ');
				out.push_str(name);
				out.push_str("=\"");
				escape_attribute(value, out);
				out.push('"');
			}
			out.push('>');
			if VOID_ELEMENTS.contains(&element.name()) {
				return;
			}
			for &child in document.children(id) {
				serialize(document, child, out);
			}
			out.push_str("</");
			out.push_str(element.name());
			out.push('>');
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn round_trip(html: &str) -> String {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, html).unwrap();
		doc.inner_html(body)
	}

	#[test]
	fn nested_elements_and_attributes() {
		assert_eq!(
			round_trip(r#"<div id=a class='b c' hidden><p>x<br>y</p></div>"#),
			r#"<div id="a" class="b c" hidden=""><p>x<br>y</p></div>"#
		);
	}

	#[test]
	fn entities() {
		assert_eq!(round_trip("a &amp; b &lt;c&gt; &#65;&#x42;"), "a &amp; b &lt;c&gt; AB");
		assert_eq!(round_trip(r#"<i title="&quot;q&quot;"></i>"#), r#"<i title="&quot;q&quot;"></i>"#);
	}

	#[test]
	fn raw_text_and_comments() {
		assert_eq!(round_trip("<style>a > b {}</style><!-- hi -->"), "<style>a > b {}</style><!-- hi -->");
	}

	#[test]
	fn stray_markup() {
		assert_eq!(round_trip("1 < 2</span><b>x"), "1 &lt; 2<b>x</b>");
		// Custom elements can't self-close, so the `<i>` ends up inside.
		assert_eq!(round_trip("<x-a/><i>y</i>"), "<x-a><i>y</i></x-a>");
	}

	#[test]
	fn tree_builder_closes_implied_end_tags() {
		assert_eq!(round_trip("<ul><li>a<li>b</ul><p>x<p>y"), "<ul><li>a</li><li>b</li></ul><p>x</p><p>y</p>");
		assert_eq!(round_trip("<table><tr><td>1</td></tr></table>"), "<table><tbody><tr><td>1</td></tr></tbody></table>");
	}

	#[test]
	fn whitespace_text_is_kept() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, "<ul>\n <li>a</li>\n</ul>").unwrap();
		let ul = doc.children(body)[0];
		assert_eq!(doc.children(ul).len(), 3);
	}
}
