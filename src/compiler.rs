//! The one-time template compiler.
//!
//! Directive attributes are cut out of the raw HTML and replaced by bare placeholder attributes,
//! so that after stamping the template the affected nodes can be found again by attribute name.
//! `{{ … }}` interpolations become empty marker `<span>`s (HTML) or bare placeholder tokens (CSS).

use hashbrown::HashMap;
use indexmap::IndexMap;
use std::rc::Rc;
use tracing::{error, instrument, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DirectiveKind {
	Bind,
	Input,
	Output,
	Attribute,
	Executable,
	Event,
	If,
	ForValue,
	ForKey,
	Pack,
	Use,
	UseName,
	Get,
	ForMin,
	ForMinDefault,
	For,
}

impl DirectiveKind {
	/// Later scans run on text already rewritten by earlier ones, so this order is significant.
	pub const COMPILE_ORDER: [Self; 16] = [
		Self::Bind,
		Self::Input,
		Self::Output,
		Self::Attribute,
		Self::Executable,
		Self::Event,
		Self::If,
		Self::ForValue,
		Self::ForKey,
		Self::Pack,
		Self::Use,
		Self::UseName,
		Self::Get,
		Self::ForMin,
		Self::ForMinDefault,
		Self::For,
	];

	/// The order in which stamped nodes are assigned their directives. Loops are registered separately, before this.
	pub(crate) const ASSIGN_ORDER: [Self; 15] = [
		Self::ForKey,
		Self::ForValue,
		Self::If,
		Self::Output,
		Self::Input,
		Self::Attribute,
		Self::Bind,
		Self::Event,
		Self::Executable,
		Self::Pack,
		Self::UseName,
		Self::Use,
		Self::Get,
		Self::ForMin,
		Self::ForMinDefault,
	];

	#[must_use]
	pub fn landmark(self) -> &'static str {
		match self {
			Self::Bind => "@b:",
			Self::Input => "@i:",
			Self::Output => "@o:",
			Self::Attribute => "@a:",
			Self::Executable => "{{",
			Self::Event => "@e:",
			Self::If => "@if",
			Self::ForValue => "@value",
			Self::ForKey => "@key",
			Self::Pack => "@pack",
			Self::Use => "@use",
			Self::UseName => "@uname",
			Self::Get => "@get",
			Self::ForMin => "@min",
			Self::ForMinDefault => "@def-min",
			Self::For => "@for",
		}
	}

	#[must_use]
	pub fn prefix(self) -> &'static str {
		match self {
			Self::Bind => "b",
			Self::Input => "i",
			Self::Output => "o",
			Self::Attribute => "a",
			Self::Executable => "exec_",
			Self::Event => "e",
			Self::If => "if",
			Self::ForValue => "v",
			Self::ForKey => "k",
			Self::Pack => "p",
			Self::Use => "u",
			Self::UseName => "un",
			Self::Get => "g",
			Self::ForMin => "m",
			Self::ForMinDefault => "di",
			Self::For => "for",
		}
	}

	/// Whether the directive carries a name after its landmark, like `@e:click`.
	#[must_use]
	pub fn is_named(self) -> bool {
		matches!(self, Self::Bind | Self::Input | Self::Output | Self::Attribute | Self::Event)
	}

	/// Unique directives are set up once per concrete node and torn down when a loop recycles it.
	#[must_use]
	pub fn is_unique(self) -> bool {
		matches!(self, Self::Bind | Self::Output | Self::Event | Self::Get)
	}

	#[must_use]
	pub fn label(self) -> &'static str {
		match self {
			Self::Bind => "bind",
			Self::Input => "input",
			Self::Output => "output",
			Self::Attribute => "attribute",
			Self::Executable => "executable",
			Self::Event => "event",
			Self::If => "if",
			Self::ForValue => "value",
			Self::ForKey => "key",
			Self::Pack => "pack",
			Self::Use => "use",
			Self::UseName => "uname",
			Self::Get => "get",
			Self::ForMin => "min",
			Self::ForMinDefault => "def-min",
			Self::For => "for",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
	pub name: Option<Rc<str>>,
	pub value: Rc<str>,
}

/// Placeholder → directive, in the order the placeholders were created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTable {
	entries: IndexMap<Rc<str>, Directive>,
}

impl ActionTable {
	#[must_use]
	pub fn get(&self, placeholder: &str) -> Option<&Directive> {
		self.entries.get(placeholder)
	}

	fn insert(&mut self, placeholder: Rc<str>, directive: Directive) {
		self.entries.insert(placeholder, directive);
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Directive)> + '_ {
		self.entries.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledHtml {
	pub html: String,
	tables: HashMap<DirectiveKind, ActionTable>,
	placeholders: HashMap<Rc<str>, DirectiveKind>,
}

impl CompiledHtml {
	#[must_use]
	pub fn table(&self, kind: DirectiveKind) -> Option<&ActionTable> {
		self.tables.get(&kind)
	}

	/// Which directive a placeholder attribute stands for.
	#[must_use]
	pub fn lookup(&self, placeholder: &str) -> Option<(DirectiveKind, &Directive)> {
		let kind = *self.placeholders.get(placeholder)?;
		Some((kind, self.tables.get(&kind)?.get(placeholder)?))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledCss {
	pub css: String,
	pub executables: ActionTable,
	/// Rules containing `@self`, rewritten per instance.
	pub scoped: Vec<Rc<str>>,
	/// Rules inserted once per class, as they are.
	pub global: Vec<Rc<str>>,
}

/// Index of the next unescaped `quote` at or after `start`.
fn string_end(text: &str, quote: char, start: usize) -> Option<usize> {
	let mut from = start;
	loop {
		let position = from + text.get(from..)?.find(quote)?;
		if position > 0 && text.as_bytes()[position - 1] == b'\\' {
			from = position + 1;
		} else {
			return Some(position);
		}
	}
}

fn compile_attributes(mut text: String, kind: DirectiveKind, table: &mut ActionTable) -> String {
	let landmark = kind.landmark();
	let mut search_from = 0;
	while let Some(start) = text.get(search_from..).and_then(|rest| rest.find(landmark)).map(|i| i + search_from) {
		if start == 0 {
			search_from = landmark.len();
			continue;
		}
		let Some(equals) = text[start..].find('=').map(|i| i + start) else {
			error!("`{}` without a value, skipping", landmark);
			break;
		};
		let quote = text[equals + 1..].chars().next();
		let quote = match quote {
			Some(quote @ ('"' | '\'' | '`')) => quote,
			found => {
				error!("String wrapper for `{}` not found (found `{:?}`), skipping", landmark, found);
				search_from = equals;
				continue;
			}
		};
		let Some(end) = string_end(&text, quote, equals + 2) else {
			error!("Unterminated value for `{}`, skipping", landmark);
			break;
		};

		let placeholder: Rc<str> = format!("{}{}-{}", kind.prefix(), start, end).into();
		let directive = Directive {
			name: kind.is_named().then(|| text[start + landmark.len()..equals].trim().into()),
			value: text[equals + 2..end].into(),
		};
		trace!(?kind, %placeholder, "Compiled directive");
		table.insert(placeholder.clone(), directive);
		let original = text[start..=end].to_owned();
		text = text.replace(&original, &placeholder);
		search_from = start;
	}
	text
}

fn compile_executables(mut text: String, table: &mut ActionTable, marker: impl Fn(&str) -> String) -> String {
	let mut search_from = 0;
	while let Some(start) = text.get(search_from..).and_then(|rest| rest.find("{{")).map(|i| i + search_from) {
		let Some(end) = text[start..].find("}}").map(|i| i + start) else {
			break;
		};
		let placeholder: Rc<str> = format!("exec_{}_{}", start, end).into();
		table.insert(
			placeholder.clone(),
			Directive {
				name: None,
				value: text[start + 2..end].into(),
			},
		);
		let original = text[start..end + 2].to_owned();
		text = text.replace(&original, &marker(&placeholder));
		search_from = start + placeholder.len();
	}
	text
}

/// Rewrites directive syntax in `raw` into placeholders. Pure, and never fails: malformed directives are logged and skipped.
#[must_use]
#[instrument(skip(raw))]
pub fn compile_html(raw: &str) -> CompiledHtml {
	let mut compiled = CompiledHtml::default();
	let mut text = raw.to_owned();
	for kind in DirectiveKind::COMPILE_ORDER {
		let mut table = ActionTable::default();
		text = match kind {
			DirectiveKind::Executable => compile_executables(text, &mut table, |placeholder| format!("<span {}></span>", placeholder)),
			kind => compile_attributes(text, kind, &mut table),
		};
		for (placeholder, _) in table.iter() {
			compiled.placeholders.insert(placeholder.clone(), kind);
		}
		compiled.tables.insert(kind, table);
	}
	compiled.html = text;
	compiled
}

/// Top-level rules of `css`, found by brace depth. Braces inside string literals don't count.
fn separate_rules(css: &str) -> Vec<Rc<str>> {
	let bytes = css.as_bytes();
	let mut rules = Vec::new();
	let mut in_rule = false;
	let mut nested = 0_usize;
	let mut last_end = 0;
	let mut i = 0;
	while i < bytes.len() {
		let letter = bytes[i];
		if !in_rule {
			in_rule = letter == b'{';
		} else {
			match letter {
				b'"' | b'\'' | b'`' => match string_end(css, char::from(letter), i + 1) {
					Some(end) => i = end,
					None => break,
				},
				b'{' => nested += 1,
				b'}' if nested > 0 => nested -= 1,
				b'}' => {
					rules.push(css[last_end..=i].trim().into());
					last_end = i + 1;
					in_rule = false;
				}
				_ => (),
			}
		}
		i += 1;
	}
	rules
}

/// Compiles executables in `raw` and sorts its rules into scoped and global ones.
#[must_use]
#[instrument(skip(raw))]
pub fn compile_css(raw: &str) -> CompiledCss {
	let mut executables = ActionTable::default();
	let css = compile_executables(raw.to_owned(), &mut executables, str::to_owned);
	let (scoped, global) = separate_rules(&css).into_iter().partition(|rule| rule.contains("@self"));
	CompiledCss {
		css,
		executables,
		scoped,
		global,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn attributes_become_placeholders() {
		let compiled = compile_html(r#"<p @a:title="$.t" @e:click='go($event)'>x</p>"#);
		assert_eq!(compiled.html, "<p a3-16 e9-29>x</p>");
		let (kind, directive) = compiled.lookup("a3-16").unwrap();
		assert_eq!(kind, DirectiveKind::Attribute);
		assert_eq!(directive.name.as_deref(), Some("title"));
		assert_eq!(&*directive.value, "$.t");
		let (kind, directive) = compiled.lookup("e9-29").unwrap();
		assert_eq!(kind, DirectiveKind::Event);
		assert_eq!(&*directive.value, "go($event)");
	}

	#[test]
	fn executables_become_marker_spans() {
		let compiled = compile_html("<b>{{ a }}</b>{{ a }}");
		assert_eq!(compiled.html, "<b><span exec_3_8></span></b><span exec_3_8></span>");
		assert_eq!(&*compiled.table(DirectiveKind::Executable).unwrap().get("exec_3_8").unwrap().value, " a ");
	}

	#[test]
	fn loop_directives() {
		let compiled = compile_html(r#"<ul><li @for="$.items" @key="i" @value="v">{{ i }}</li></ul>"#);
		let table = |kind| compiled.table(kind).unwrap().iter().map(|(_, d)| d.value.to_string()).collect::<Vec<_>>();
		assert_eq!(table(DirectiveKind::For), vec!["$.items"]);
		assert_eq!(table(DirectiveKind::ForKey), vec!["i"]);
		assert_eq!(table(DirectiveKind::ForValue), vec!["v"]);
		assert!(!compiled.html.contains('@'));
	}

	#[test]
	fn escaped_quotes_and_malformed_values() {
		let compiled = compile_html(r#"<i @if="a == \"b\"" @a:x=y @get="'n'"></i>"#);
		assert_eq!(&*compiled.table(DirectiveKind::If).unwrap().iter().next().unwrap().1.value, r#"a == \"b\""#);
		assert!(compiled.table(DirectiveKind::Attribute).unwrap().is_empty());
		assert!(compiled.html.contains("@a:x=y"));
		assert_eq!(compiled.table(DirectiveKind::Get).unwrap().len(), 1);
	}

	#[test]
	fn landmark_at_the_very_start_is_text() {
		let compiled = compile_html(r#"@if="x" <i @if="y"></i>"#);
		assert!(compiled.html.starts_with(r#"@if="x""#));
		assert_eq!(compiled.table(DirectiveKind::If).unwrap().len(), 1);
	}

	#[test]
	fn idempotent() {
		let raw = r#"<div @b:value="$.v" @i:x='1'><span @for="3" @min="4" @def-min="'-'">{{ $value }}</span><dito-inject @pack="'a'" @use="$.u" @uname="u"></dito-inject></div>"#;
		assert_eq!(compile_html(raw), compile_html(raw));
	}

	#[test]
	fn css_rules() {
		let compiled = compile_css("@self { color: {{ $css.color }}; } a[title=\"}\"] { b: c; } @media x { @self p { d: e; } }");
		assert_eq!(compiled.executables.len(), 1);
		assert_eq!(
			compiled.scoped.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
			vec!["@self { color: exec_15_29; }", "@media x { @self p { d: e; } }"]
		);
		assert_eq!(compiled.global.iter().map(|r| r.to_string()).collect::<Vec<_>>(), vec!["a[title=\"}\"] { b: c; }"]);
	}

	#[test]
	fn placeholders_are_listed_in_source_order() {
		let compiled = compile_html(r#"<p @a:x="1"></p><p @a:y="2"></p><p @a:z="3"></p>"#);
		let table = compiled.table(DirectiveKind::Attribute).unwrap();
		let names = table.iter().filter_map(|(_, d)| d.name.as_deref()).collect::<Vec<_>>();
		assert_eq!(names, ["x", "y", "z"]);
		for (placeholder, directive) in table.iter() {
			assert_eq!(table.get(placeholder), Some(directive));
		}
	}
}
