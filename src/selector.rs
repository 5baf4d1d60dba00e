//! CSS selector matching against the arena, for `querySelector`-style lookups.
//!
//! Selectors are parsed and matched by the [`selectors`] crate, using [`scraper`]'s selector implementation.
//! [`ElementRef`] adapts arena elements to the [`selectors::Element`] trait.

use crate::{
	dom::{Document, NodeId},
	Error, Result,
};
use cssparser::ParserInput;
use scraper::selector::Simple;
use selectors::{
	attr::{AttrSelectorOperation, CaseSensitivity, NamespaceConstraint},
	bloom::BloomFilter,
	context::{MatchingContext, MatchingForInvalidation, MatchingMode, NeedsSelectorFlags, QuirksMode, SelectorCaches},
	matching::{self, ElementSelectorFlags},
	parser::{ParseRelative, SelectorImpl, SelectorList, SelectorParseErrorKind},
	OpaqueElement,
};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

type LocalName = <Simple as SelectorImpl>::LocalName;
type Identifier = <Simple as SelectorImpl>::Identifier;
type Namespace = <Simple as SelectorImpl>::NamespaceUrl;
type AttrValue = <Simple as SelectorImpl>::AttrValue;

struct Parser;
impl<'i> selectors::parser::Parser<'i> for Parser {
	type Impl = Simple;
	type Error = SelectorParseErrorKind<'i>;
}

#[derive(Debug, Clone)]
pub struct Selector {
	list: SelectorList<Simple>,
}

impl Selector {
	pub fn parse(source: &str) -> Result<Self> {
		let mut input = ParserInput::new(source);
		let mut parser = cssparser::Parser::new(&mut input);
		SelectorList::parse(&Parser, &mut parser, ParseRelative::No)
			.map(|list| Self { list })
			.map_err(|_| Error::Selector(source.to_owned()))
	}

	#[must_use]
	pub fn matches(&self, document: &Document, node: NodeId) -> bool {
		if !document.is_element(node) {
			return false;
		}
		let mut caches = SelectorCaches::default();
		let mut context = MatchingContext::new(
			MatchingMode::Normal,
			None,
			&mut caches,
			QuirksMode::NoQuirks,
			NeedsSelectorFlags::No,
			MatchingForInvalidation::No,
		);
		matching::matches_selector_list(&self.list, &ElementRef { document, id: node }, &mut context)
	}
}

/// An element in a [`Document`], as seen by the selector matcher.
#[derive(Debug, Clone, Copy)]
struct ElementRef<'a> {
	document: &'a Document,
	id: NodeId,
}

impl ElementRef<'_> {
	fn name(&self) -> &str {
		self.document.tag_name(self.id).unwrap_or_default()
	}

	fn sibling_element(&self, step: isize) -> Option<Self> {
		let parent = self.document.parent(self.id)?;
		let siblings = self.document.children(parent);
		let mut index = siblings.iter().position(|&id| id == self.id)?;
		loop {
			index = index.checked_add_signed(step)?;
			let id = *siblings.get(index)?;
			if self.document.is_element(id) {
				return Some(self.with(id));
			}
		}
	}

	fn with(&self, id: NodeId) -> Self {
		Self { document: self.document, id }
	}
}

impl selectors::Element for ElementRef<'_> {
	type Impl = Simple;

	fn opaque(&self) -> OpaqueElement {
		OpaqueElement::new(self.document.data(self.id))
	}

	fn parent_element(&self) -> Option<Self> {
		self.document.parent(self.id).filter(|&parent| self.document.is_element(parent)).map(|parent| self.with(parent))
	}

	fn parent_node_is_shadow_root(&self) -> bool {
		false
	}

	fn containing_shadow_host(&self) -> Option<Self> {
		None
	}

	fn is_pseudo_element(&self) -> bool {
		false
	}

	fn prev_sibling_element(&self) -> Option<Self> {
		self.sibling_element(-1)
	}

	fn next_sibling_element(&self) -> Option<Self> {
		self.sibling_element(1)
	}

	fn first_element_child(&self) -> Option<Self> {
		self.document.element_children(self.id).next().map(|child| self.with(child))
	}

	fn is_html_element_in_html_document(&self) -> bool {
		true
	}

	fn has_local_name(&self, local_name: &<Simple as SelectorImpl>::BorrowedLocalName) -> bool {
		*local_name.0 == *self.name()
	}

	fn has_namespace(&self, ns: &<Simple as SelectorImpl>::BorrowedNamespaceUrl) -> bool {
		**ns == *HTML_NAMESPACE
	}

	fn is_same_type(&self, other: &Self) -> bool {
		self.name() == other.name()
	}

	fn attr_matches(&self, ns: &NamespaceConstraint<&Namespace>, local_name: &LocalName, operation: &AttrSelectorOperation<&AttrValue>) -> bool {
		if let NamespaceConstraint::Specific(url) = ns {
			if !url.is_empty() {
				return false;
			}
		}
		self.document.get_attribute(self.id, &local_name.0).map_or(false, |value| operation.eval_str(value))
	}

	fn match_non_ts_pseudo_class(&self, _: &<Simple as SelectorImpl>::NonTSPseudoClass, _: &mut MatchingContext<'_, Simple>) -> bool {
		false
	}

	fn match_pseudo_element(&self, _: &<Simple as SelectorImpl>::PseudoElement, _: &mut MatchingContext<'_, Simple>) -> bool {
		false
	}

	fn apply_selector_flags(&self, _: ElementSelectorFlags) {}

	fn is_link(&self) -> bool {
		matches!(self.name(), "a" | "area" | "link") && self.document.has_attribute(self.id, "href")
	}

	fn is_html_slot_element(&self) -> bool {
		self.name() == "slot"
	}

	fn has_id(&self, id: &Identifier, case_sensitivity: CaseSensitivity) -> bool {
		self.document
			.get_attribute(self.id, "id")
			.map_or(false, |value| case_sensitivity.eq(id.0.as_bytes(), value.as_bytes()))
	}

	fn has_class(&self, name: &Identifier, case_sensitivity: CaseSensitivity) -> bool {
		self.document.get_attribute(self.id, "class").map_or(false, |classes| {
			classes.split_ascii_whitespace().any(|class| case_sensitivity.eq(name.0.as_bytes(), class.as_bytes()))
		})
	}

	fn has_custom_state(&self, _: &Identifier) -> bool {
		false
	}

	fn imported_part(&self, _: &Identifier) -> Option<Identifier> {
		None
	}

	fn is_part(&self, _: &Identifier) -> bool {
		false
	}

	fn is_empty(&self) -> bool {
		self.document.children(self.id).iter().all(|&child| match self.document.text(child) {
			Some(text) => !self.document.is_text(child) || text.is_empty(),
			None => false,
		})
	}

	fn is_root(&self) -> bool {
		self.document.parent(self.id).is_none()
	}

	fn add_element_unique_hashes(&self, _: &mut BloomFilter) -> bool {
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn descendant_paths() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, r#"<x-a dito-i="0" dito-t="5"><div><a dito-anchor="1"></a></div></x-a>"#).unwrap();
		let a = doc.query_selector(body, r#"x-a[dito-i="0"][dito-t="5"] a[dito-anchor="1"]"#).unwrap();
		assert!(a.is_some());
		assert_eq!(doc.query_selector(body, r#"x-a[dito-i="1"] a"#).unwrap(), None);
		assert_eq!(doc.query_selector(body, "div a, span").unwrap(), a);
	}

	#[test]
	fn attribute_presence() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, "<p hidden></p><p></p>").unwrap();
		assert_eq!(doc.query_selector_all(body, "p[hidden]").unwrap().len(), 1);
		assert_eq!(doc.query_selector_all(body, "*").unwrap().len(), 2);
	}

	#[test]
	fn combinators_and_classes() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, r#"<ul class="x y"><li>a</li><li id="b">b<i></i></li></ul><i></i>"#).unwrap();
		let ul = doc.children(body)[0];
		let second = doc.children(ul)[1];
		assert_eq!(doc.query_selector(body, "ul.y > li + li").unwrap(), Some(second));
		assert_eq!(doc.query_selector(body, "#b").unwrap(), Some(second));
		assert_eq!(doc.query_selector_all(body, "ul > i").unwrap(), vec![]);
		assert_eq!(doc.query_selector_all(body, "li:first-child").unwrap(), vec![doc.children(ul)[0]]);
		assert_eq!(doc.query_selector_all(body, "i").unwrap().len(), 2);
	}

	#[test]
	fn outer_parts_may_match_above_the_root() {
		let mut doc = Document::new();
		let body = doc.body();
		doc.set_inner_html(body, "<section><p><b></b></p></section>").unwrap();
		let p = doc.children(doc.children(body)[0])[0];
		assert!(doc.query_selector(p, "section b").unwrap().is_some());
		assert_eq!(doc.query_selector(p, "p").unwrap(), None);
	}

	#[test]
	fn rejects_garbage() {
		assert!(Selector::parse("a > b").is_ok());
		assert!(Selector::parse("[x").is_err());
		assert!(Selector::parse(",").is_err());
		assert!(Selector::parse("a >").is_err());
	}
}
