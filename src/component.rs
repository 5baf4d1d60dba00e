use crate::{
	compiler::{compile_css, compile_html, CompiledCss, CompiledHtml},
	dom::{Document, NodeId},
	runtime::{InstanceId, Runtime},
	value::Value,
	Error, Result,
};
use core::{
	cell::{Cell, OnceCell},
	fmt::{self, Debug, Formatter},
};
use std::rc::Rc;

/// Behaviour of a component type. Every hook has a no-op default.
///
/// Hooks are never re-entered for the same instance: while one runs, the instance's behaviour is checked out,
/// and anything that would need it again (like a template calling one of its [methods](`Lifecycle::call`)) fails with [`Error::ComponentBusy`].
#[allow(unused_variables)]
pub trait Lifecycle {
	/// Runs when the instance is created, before [defaults](`Lifecycle::defaults`) are applied.
	fn prepare(&mut self, cx: &mut Context<'_>) {}

	/// Runs once, when the instance is first connected.
	fn init(&mut self, cx: &mut Context<'_>) {}

	fn before_render(&mut self, cx: &mut Context<'_>) {}
	fn before_first_render(&mut self, cx: &mut Context<'_>) {}
	fn after_render(&mut self, cx: &mut Context<'_>, result: &Result<()>) {}
	fn after_first_render(&mut self, cx: &mut Context<'_>, result: &Result<()>) {}
	fn before_css_render(&mut self, cx: &mut Context<'_>) {}
	fn after_css_render(&mut self, cx: &mut Context<'_>, result: &Result<()>) {}

	/// Attributes merged into the host element when the instance is created.
	fn defaults(&self) -> Defaults {
		Defaults::new()
	}

	/// Names that templates can call, dispatched through [`Lifecycle::call`].
	fn methods(&self) -> &'static [&'static str] {
		&[]
	}

	/// # Errors
	///
	/// Whatever the method fails with. The default knows no methods.
	fn call(&mut self, cx: &mut Context<'_>, method: &str, arguments: &[Value]) -> Result<Value> {
		Err(Error::UnknownMethod(method.to_owned()))
	}
}

/// A component's view of the runtime while one of its hooks or methods runs.
pub struct Context<'rt> {
	runtime: &'rt mut Runtime,
	instance: InstanceId,
}

impl<'rt> Context<'rt> {
	pub(crate) fn new(runtime: &'rt mut Runtime, instance: InstanceId) -> Self {
		Self { runtime, instance }
	}

	#[must_use]
	pub fn instance(&self) -> InstanceId {
		self.instance
	}

	/// The host element.
	#[must_use]
	pub fn node(&self) -> NodeId {
		self.runtime.host(self.instance)
	}

	/// A state field, or `undefined`.
	#[must_use]
	pub fn get(&self, field: &str) -> Value {
		self.runtime.state(self.instance, field).cloned().unwrap_or_default()
	}

	/// Writes a state field, which schedules a render if the value changed.
	///
	/// # Errors
	///
	/// [`Error::ReservedField`] for names starting with `$`.
	pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
		self.runtime.set_state(self.instance, field, value.into())
	}

	#[must_use]
	pub fn get_css(&self, field: &str) -> Value {
		self.runtime.css_var(self.instance, field).cloned().unwrap_or_default()
	}

	/// Writes a CSS variable, which schedules a CSS-only render if the value changed.
	pub fn set_css(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
		self.runtime.set_css(self.instance, field, value.into())
	}

	/// Fires the output handler the parent template installed on this component as `@o:<output>`.
	pub fn emit(&mut self, output: &str, value: impl Into<Value>) -> Result<Value> {
		self.runtime.emit(self.instance, output, value.into())
	}

	/// A node registered with `@get`.
	#[must_use]
	pub fn named_node(&self, name: &str) -> Option<NodeId> {
		self.runtime.named_node(self.instance, name)
	}

	#[must_use]
	pub fn document(&self) -> &Document {
		self.runtime.document()
	}

	pub fn document_mut(&mut self) -> &mut Document {
		self.runtime.document_mut()
	}

	pub fn runtime(&mut self) -> &mut Runtime {
		self.runtime
	}
}

pub type Factory = Box<dyn Fn() -> Box<dyn Lifecycle>>;

/// A registered component type: its template, its style and how to create its behaviour.
///
/// Both are compiled lazily and at most once, however many instances there are.
pub struct ComponentClass {
	tag: Rc<str>,
	html: String,
	css: String,
	factory: Factory,
	compiled_html: OnceCell<CompiledHtml>,
	compiled_css: OnceCell<CompiledCss>,
	compilations: Cell<usize>,
	globals_inserted: Cell<bool>,
}

impl Debug for ComponentClass {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("ComponentClass")
			.field("tag", &self.tag)
			.field("compiled_html", &self.compiled_html.get().is_some())
			.field("compiled_css", &self.compiled_css.get().is_some())
			.finish_non_exhaustive()
	}
}

impl ComponentClass {
	pub(crate) fn new(tag: &str, html: &str, css: &str, factory: Factory) -> Self {
		Self {
			tag: tag.into(),
			html: html.to_owned(),
			css: css.to_owned(),
			factory,
			compiled_html: OnceCell::new(),
			compiled_css: OnceCell::new(),
			compilations: Cell::new(0),
			globals_inserted: Cell::new(false),
		}
	}

	#[must_use]
	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub(crate) fn tag_rc(&self) -> Rc<str> {
		self.tag.clone()
	}

	pub(crate) fn instantiate(&self) -> Box<dyn Lifecycle> {
		(self.factory)()
	}

	pub fn compiled_html(&self) -> &CompiledHtml {
		self.compiled_html.get_or_init(|| {
			self.compilations.set(self.compilations.get() + 1);
			compile_html(&self.html)
		})
	}

	pub fn compiled_css(&self) -> &CompiledCss {
		self.compiled_css.get_or_init(|| {
			self.compilations.set(self.compilations.get() + 1);
			compile_css(&self.css)
		})
	}

	/// How many times the template and style were compiled. Never more than once each.
	#[must_use]
	pub fn compilations(&self) -> usize {
		self.compilations.get()
	}

	/// Returns `true` exactly once, for whoever then inserts the global rules.
	pub(crate) fn claim_global_rules(&self) -> bool {
		!self.globals_inserted.replace(true)
	}
}

/// How a default attribute value is merged into what the host element already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DefaultKind {
	/// `current + " " + value`.
	#[default]
	Append,
	Replace,
	/// `current + value`.
	Add,
}

impl DefaultKind {
	#[must_use]
	pub fn merge(self, current: Option<&str>, value: &str) -> String {
		let current = current.unwrap_or_default();
		match self {
			Self::Append => format!("{} {}", current, value),
			Self::Replace => value.to_owned(),
			Self::Add => format!("{}{}", current, value),
		}
	}
}

/// Attribute defaults of a component, merged into its host element on creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defaults {
	entries: Vec<(String, String, DefaultKind)>,
}

impl Defaults {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn append(self, name: &str, value: &str) -> Self {
		self.with_kind(name, value, DefaultKind::Append)
	}

	#[must_use]
	pub fn replace(self, name: &str, value: &str) -> Self {
		self.with_kind(name, value, DefaultKind::Replace)
	}

	#[must_use]
	pub fn add(self, name: &str, value: &str) -> Self {
		self.with_kind(name, value, DefaultKind::Add)
	}

	#[must_use]
	pub fn with_kind(mut self, name: &str, value: &str, kind: DefaultKind) -> Self {
		self.entries.push((name.to_owned(), value.to_owned(), kind));
		self
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str, DefaultKind)> + '_ {
		self.entries.iter().map(|(n, v, k)| (n.as_str(), v.as_str(), *k))
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
