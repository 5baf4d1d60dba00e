//! The component runtime: registry, instances, render and CSS passes.

use crate::{
	binder::{BindLink, NodeRecord, Receiver},
	component::{ComponentClass, Context, Defaults, Lifecycle},
	compiler::Directive,
	dom::{Document, NodeId},
	eval::{evaluate, Frame, Host, ProgramCache, ProgramKind},
	events::{Handler, Listener},
	observable::Observable,
	rc_hash_map::RcHashMap,
	scheduler::{Pass, Scheduler},
	stylesheet::Stylesheet,
	value::{Callable, Object, Value},
	Error, Result,
};
use core::{
	cell::Cell,
	fmt::{self, Debug, Formatter},
	mem,
	time::Duration,
};
use hashbrown::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{error, info, instrument, trace, trace_span};

thread_local! {
	static ACTIVE: Cell<bool> = Cell::new(false);
}

/// Set on a host element once it finished its first render.
pub const READY_ATTRIBUTE: &str = "dito-ready";
/// Opts a host element out of the fade-in rules.
pub const SHOW_ATTRIBUTE: &str = "dito-show";
const TIME_ATTRIBUTE: &str = "dito-t";
const INDEX_ATTRIBUTE: &str = "dito-i";

/// Handle of a component instance within its [`Runtime`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
	pub(crate) fn new(index: u32) -> Self {
		Self(index)
	}

	fn index(self) -> usize {
		self.0 as usize
	}
}

impl Debug for InstanceId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "@{}", self.0)
	}
}

/// Runtime configuration.
pub struct Settings {
	debounce: Duration,
	css_debounce: Duration,
	on_ready: Option<Box<dyn FnMut()>>,
	max_firings: usize,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			debounce: Duration::from_millis(10),
			css_debounce: Duration::from_millis(10),
			on_ready: None,
			max_firings: 10_000,
		}
	}
}

impl Debug for Settings {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Settings")
			.field("debounce", &self.debounce)
			.field("css_debounce", &self.css_debounce)
			.field("on_ready", &self.on_ready.is_some())
			.field("max_firings", &self.max_firings)
			.finish()
	}
}

impl Settings {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// How long state changes are collected before a render runs.
	#[must_use]
	pub fn debounce(mut self, debounce: Duration) -> Self {
		self.debounce = debounce;
		self
	}

	#[must_use]
	pub fn css_debounce(mut self, css_debounce: Duration) -> Self {
		self.css_debounce = css_debounce;
		self
	}

	/// Called once, when every instance that was waiting for its first render has rendered.
	#[must_use]
	pub fn on_ready(mut self, on_ready: impl FnMut() + 'static) -> Self {
		self.on_ready = Some(Box::new(on_ready));
		self
	}

	/// Upper bound of timer firings in a single [`Runtime::advance`] or [`Runtime::run_until_idle`].
	#[must_use]
	pub fn max_firings(mut self, max_firings: usize) -> Self {
		self.max_firings = max_firings;
		self
	}
}

#[derive(Debug, Clone)]
pub(crate) struct ScopedRule {
	pub rule: Rc<str>,
	pub index: Option<usize>,
}

pub(crate) struct Instance {
	pub host: NodeId,
	pub class: Rc<ComponentClass>,
	pub behavior: Option<Box<dyn Lifecycle>>,
	pub methods: Vec<Rc<str>>,
	pub state: Observable,
	pub css: Observable,
	pub parent: Option<InstanceId>,
	/// Nodes with per-render actions, in discovery order.
	pub children: Vec<NodeId>,
	pub child_set: HashSet<NodeId>,
	/// Nodes whose one-time actions (events, binds, outputs, gets) are still to be set up.
	pub unique_children: Vec<NodeId>,
	pub unique_nodes: HashSet<NodeId>,
	pub for_nodes: Vec<NodeId>,
	/// Outgoing two-way binds, refreshed after each render.
	pub binder: Vec<BindLink>,
	/// Incoming two-way binds by receiving field.
	pub bound: HashMap<Rc<str>, BindLink>,
	pub to_bind: Vec<(NodeId, Directive)>,
	pub to_input: HashMap<NodeId, Vec<Directive>>,
	/// The light DOM the host had before its first render.
	pub injected: Option<Vec<NodeId>>,
	pub gets: HashMap<Rc<str>, NodeId>,
	pub selector: String,
	pub css_rules: Option<Vec<ScopedRule>>,
	pub css_rendered: bool,
	pub rendered: bool,
	pub rendering: bool,
	pub initialized: bool,
	pub render_queued: bool,
	pub css_queued: bool,
}

impl Instance {
	fn new(host: NodeId, class: Rc<ComponentClass>, behavior: Box<dyn Lifecycle>, parent: Option<InstanceId>) -> Self {
		let methods = behavior.methods().iter().map(|&m| Rc::from(m)).collect();
		Self {
			host,
			class,
			behavior: Some(behavior),
			methods,
			state: Observable::new(),
			css: Observable::new(),
			parent,
			children: Vec::new(),
			child_set: HashSet::new(),
			unique_children: Vec::new(),
			unique_nodes: HashSet::new(),
			for_nodes: Vec::new(),
			binder: Vec::new(),
			bound: HashMap::new(),
			to_bind: Vec::new(),
			to_input: HashMap::new(),
			injected: None,
			gets: HashMap::new(),
			selector: String::new(),
			css_rules: None,
			css_rendered: false,
			rendered: false,
			rendering: false,
			initialized: false,
			render_queued: false,
			css_queued: false,
		}
	}
}

/// Owns the document, the style sheet and all component instances.
///
/// There can be only one per thread, like there is only one custom element registry per window.
/// Time is virtual: nothing renders until the clock is moved with [`Runtime::advance`] or [`Runtime::run_until_idle`].
pub struct Runtime {
	pub(crate) settings: Settings,
	pub(crate) document: Document,
	pub(crate) stylesheet: Stylesheet,
	pub(crate) classes: HashMap<Rc<str>, Rc<ComponentClass>>,
	pub(crate) instances: Vec<Instance>,
	pub(crate) hosts: HashMap<NodeId, InstanceId>,
	pub(crate) records: HashMap<NodeId, NodeRecord>,
	pub(crate) programs: ProgramCache,
	pub(crate) scheduler: Scheduler,
	pub(crate) listeners: HashMap<NodeId, Vec<Listener>>,
	pub(crate) next_listener: u64,
	/// Waiting parent → its host, counted by unfinished children.
	pub(crate) load_waits: RcHashMap<InstanceId, u16, NodeId>,
	pub(crate) pending_first_renders: HashSet<InstanceId>,
	pub(crate) ready: bool,
}

impl Debug for Runtime {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Runtime")
			.field("settings", &self.settings)
			.field("now", &self.scheduler.now())
			.field("classes", &self.classes.len())
			.field("instances", &self.instances.len())
			.field("timers", &self.scheduler.len())
			.field("ready", &self.ready)
			.finish_non_exhaustive()
	}
}

impl Drop for Runtime {
	fn drop(&mut self) {
		ACTIVE.with(|active| active.set(false));
	}
}

impl Runtime {
	/// # Errors
	///
	/// [`Error::RuntimeExists`] iff another [`Runtime`] is alive on this thread.
	#[instrument(skip(settings))]
	pub fn new(settings: Settings) -> Result<Self> {
		if ACTIVE.with(|active| active.replace(true)) {
			return Err(Error::RuntimeExists);
		}
		info!("Starting runtime");
		Ok(Self {
			settings,
			document: Document::new(),
			stylesheet: Stylesheet::new(),
			classes: HashMap::new(),
			instances: Vec::new(),
			hosts: HashMap::new(),
			records: HashMap::new(),
			programs: ProgramCache::new(),
			scheduler: Scheduler::default(),
			listeners: HashMap::new(),
			next_listener: 0,
			load_waits: RcHashMap::new(),
			pending_first_renders: HashSet::new(),
			ready: false,
		})
	}

	#[must_use]
	pub fn document(&self) -> &Document {
		&self.document
	}

	pub fn document_mut(&mut self) -> &mut Document {
		&mut self.document
	}

	#[must_use]
	pub fn stylesheet(&self) -> &Stylesheet {
		&self.stylesheet
	}

	#[must_use]
	pub fn programs(&self) -> &ProgramCache {
		&self.programs
	}

	/// The virtual clock.
	#[must_use]
	pub fn now(&self) -> Duration {
		self.scheduler.now()
	}

	#[must_use]
	pub fn class(&self, tag: &str) -> Option<&ComponentClass> {
		self.classes.get(tag).map(|class| &**class)
	}

	/// Whether `node` is an element of a registered component type, upgraded or not.
	#[must_use]
	pub fn is_component_element(&self, node: NodeId) -> bool {
		self.document.tag_name(node).map_or(false, |tag| self.classes.contains_key(tag))
	}

	#[must_use]
	pub fn instance_of(&self, host: NodeId) -> Option<InstanceId> {
		self.hosts.get(&host).copied()
	}

	/// # Panics
	///
	/// If `id` is not from this runtime.
	#[must_use]
	pub fn host(&self, id: InstanceId) -> NodeId {
		self.instance(id).host
	}

	#[must_use]
	pub fn parent(&self, id: InstanceId) -> Option<InstanceId> {
		self.instances.get(id.index()).and_then(|instance| instance.parent)
	}

	#[must_use]
	pub fn state(&self, id: InstanceId, field: &str) -> Option<&Value> {
		self.instances.get(id.index()).and_then(|instance| instance.state.get(field))
	}

	#[must_use]
	pub fn css_var(&self, id: InstanceId, field: &str) -> Option<&Value> {
		self.instances.get(id.index()).and_then(|instance| instance.css.get(field))
	}

	#[must_use]
	pub fn named_node(&self, id: InstanceId, name: &str) -> Option<NodeId> {
		self.instances.get(id.index()).and_then(|instance| instance.gets.get(name).copied())
	}

	#[must_use]
	pub fn is_rendered(&self, id: InstanceId) -> bool {
		self.instances.get(id.index()).map_or(false, |instance| instance.rendered)
	}

	/// The CSS selector that currently matches only this instance's host.
	#[must_use]
	pub fn scope_selector(&self, id: InstanceId) -> Option<&str> {
		self.instances.get(id.index()).map(|instance| instance.selector.as_str())
	}

	/// Whether the ready callback has fired.
	#[must_use]
	pub fn is_ready(&self) -> bool {
		self.ready
	}

	pub(crate) fn instance(&self, id: InstanceId) -> &Instance {
		&self.instances[id.index()]
	}

	pub(crate) fn instance_mut(&mut self, id: InstanceId) -> &mut Instance {
		&mut self.instances[id.index()]
	}

	pub(crate) fn record_mut(&mut self, node: NodeId) -> &mut NodeRecord {
		self.records.entry(node).or_default()
	}

	/// Registers a component type under `tag`.
	///
	/// # Errors
	///
	/// - [`Error::InvalidTagName`] iff `tag` has no hyphen.
	/// - [`Error::AlreadyRegistered`] iff `tag` is taken.
	#[instrument(skip(self, html, css, factory))]
	pub fn register(&mut self, tag: &str, html: &str, css: &str, factory: impl Fn() -> Box<dyn Lifecycle> + 'static) -> Result<()> {
		if !tag.contains('-') || tag.starts_with('-') {
			return Err(Error::InvalidTagName(tag.to_owned()));
		}
		let tag = tag.to_ascii_lowercase();
		if self.classes.contains_key(tag.as_str()) {
			return Err(Error::AlreadyRegistered(tag));
		}
		self.stylesheet.push_rule(format!("{tag}:not([{READY_ATTRIBUTE}]):not([{SHOW_ATTRIBUTE}]) {{opacity: 0;}}"));
		self.stylesheet.push_rule(format!(
			"{tag}[{READY_ATTRIBUTE}]:not([{SHOW_ATTRIBUTE}]) {{opacity: 1; transition: opacity .5s;}}"
		));
		let class = ComponentClass::new(&tag, html, css, Box::new(factory));
		self.classes.insert(class.tag_rc(), Rc::new(class));
		info!("Registered component");
		Ok(())
	}

	/// Parses `html` into `parent` and upgrades every component element in it.
	///
	/// # Errors
	///
	/// If the markup can't be inserted or an upgrade fails.
	#[instrument(skip(self, html))]
	pub fn mount(&mut self, parent: NodeId, html: &str) -> Result<Vec<NodeId>> {
		let nodes = self.document.append_html(parent, html)?;
		for &node in &nodes {
			self.upgrade_subtree(node)?;
		}
		Ok(nodes)
	}

	/// Upgrades all not yet upgraded component elements within `root` (inclusive), in document order.
	///
	/// This is what a custom element registry does when elements are inserted.
	pub fn upgrade_subtree(&mut self, root: NodeId) -> Result<Vec<InstanceId>> {
		let candidates: Vec<NodeId> = self
			.document
			.subtree(root)
			.into_iter()
			.filter(|&node| self.is_component_element(node) && !self.hosts.contains_key(&node))
			.collect();
		candidates.into_iter().map(|node| self.upgrade(node, None)).collect()
	}

	pub(crate) fn upgrade(&mut self, node: NodeId, parent: Option<InstanceId>) -> Result<InstanceId> {
		let tag = self.document.tag_name(node).unwrap_or("#text");
		let class = self.classes.get(tag).cloned().ok_or_else(|| Error::UnknownComponent(tag.to_owned()))?;
		let id = InstanceId::new(u32::try_from(self.instances.len()).map_err(|_| Error::Range("too many component instances".to_owned()))?);
		let span = trace_span!("upgrade", ?node, ?id);
		let _enter = span.enter();

		self.instances.push(Instance::new(node, class.clone(), class.instantiate(), parent));
		self.hosts.insert(node, id);
		self.hook(id, |behavior, cx| behavior.prepare(cx));
		let defaults = self.with_behavior(id, |behavior, _| behavior.defaults())?;
		self.apply_defaults(id, &defaults);
		self.connect(id);
		Ok(id)
	}

	fn apply_defaults(&mut self, id: InstanceId, defaults: &Defaults) {
		let host = self.host(id);
		for (name, value, kind) in defaults.iter() {
			let merged = kind.merge(self.document.get_attribute(host, name), value);
			self.document.set_attribute(host, name, merged);
		}
	}

	/// Runs when an instance's host is (re)connected.
	pub(crate) fn connect(&mut self, id: InstanceId) {
		if !self.document.is_connected(self.host(id)) {
			return trace!(?id, "Not connected yet");
		}
		self.clear_render_queue(id);
		if !self.instance(id).rendered {
			self.pending_first_renders.insert(id);
			self.before_first_render_actions(id);
		}
		if !self.instance(id).initialized {
			self.hook(id, |behavior, cx| behavior.init(cx));
			self.instance_mut(id).initialized = true;
		}
		self.queue_render(id);
	}

	fn before_first_render_actions(&mut self, id: InstanceId) {
		let host = self.host(id);
		if let Some(parent) = self.instance(id).parent {
			if let Some(inputs) = self.instance_mut(parent).to_input.remove(&host) {
				for input in inputs {
					self.set_input(parent, &input, host, id);
				}
			}
		}
		self.set_css_scope(id);
	}

	/// Re-stamps the host so that a unique selector matches it.
	fn set_css_scope(&mut self, id: InstanceId) {
		if self.instance(id).css_rules.is_some() {
			self.queue_css_render(id);
		}
		let host = self.host(id);
		let time = self.scheduler.now().as_millis();
		let index = self.document.element_index(host).unwrap_or_default();
		self.document.set_attribute(host, TIME_ATTRIBUTE, time.to_string());
		self.document.set_attribute(host, INDEX_ATTRIBUTE, index.to_string());

		let mut selectors = Vec::new();
		let mut current = Some(id);
		while let Some(instance) = current {
			let node = self.host(instance);
			let tag = self.instance(instance).class.tag_rc();
			let index = self.document.get_attribute(node, INDEX_ATTRIBUTE).unwrap_or_default();
			let time = self.document.get_attribute(node, TIME_ATTRIBUTE).unwrap_or_default();
			selectors.push(format!("{tag}[{INDEX_ATTRIBUTE}=\"{index}\"][{TIME_ATTRIBUTE}=\"{time}\"]"));
			current = self.instance(instance).parent;
		}
		selectors.reverse();
		let selector = selectors.join(" ");
		trace!(?id, %selector, "Scoped");
		self.instance_mut(id).selector = selector;
	}

	pub(crate) fn with_behavior<R>(&mut self, id: InstanceId, f: impl FnOnce(&mut dyn Lifecycle, &mut Context<'_>) -> R) -> Result<R> {
		let mut behavior = self.instance_mut(id).behavior.take().ok_or(Error::ComponentBusy(id))?;
		let result = f(&mut *behavior, &mut Context::new(self, id));
		self.instance_mut(id).behavior = Some(behavior);
		Ok(result)
	}

	fn hook(&mut self, id: InstanceId, f: impl FnOnce(&mut dyn Lifecycle, &mut Context<'_>)) {
		if let Err(error) = self.with_behavior(id, f) {
			error!(?id, %error, "Skipped lifecycle hook");
		}
	}

	pub(crate) fn call_method(&mut self, owner: InstanceId, name: &str, arguments: &[Value]) -> Result<Value> {
		if !self.instance(owner).methods.iter().any(|method| &**method == name) {
			return Err(Error::UnknownMethod(name.to_owned()));
		}
		self.with_behavior(owner, |behavior, cx| behavior.call(cx, name, arguments))?
	}

	/// Writes a state field of `id`. A change schedules a render and is forwarded to a two-way bound provider.
	///
	/// # Errors
	///
	/// [`Error::ReservedField`] for names starting with `$`.
	pub fn set_state(&mut self, id: InstanceId, field: &str, value: Value) -> Result<()> {
		if !self.instance_mut(id).state.set(field, value.clone())? {
			return Ok(());
		}
		#[cfg(feature = "dangerous-logging")]
		trace!(?id, field, ?value, "State changed");
		#[cfg(not(feature = "dangerous-logging"))]
		trace!(?id, field, "State changed");
		self.queue_render(id);

		if let Some(link) = self.instance(id).bound.get(field).cloned() {
			if !self.state(link.provider, &link.field).map_or(false, |current| current.strict_eq(&value)) {
				self.set_state(link.provider, &link.field, value)?;
			}
		}
		Ok(())
	}

	/// Writes a CSS variable of `id`. A change schedules a CSS-only render.
	pub fn set_css(&mut self, id: InstanceId, field: &str, value: Value) -> Result<()> {
		if self.instance_mut(id).css.set(field, value)? {
			self.queue_css_render(id);
		}
		Ok(())
	}

	/// Calls the `@o:<output>` handler that the parent installed on `id`'s host.
	///
	/// # Errors
	///
	/// [`Error::Reference`] iff there is no such handler, or whatever the handler fails with.
	pub fn emit(&mut self, id: InstanceId, output: &str, value: Value) -> Result<Value> {
		let host = self.host(id);
		let (statement, owner) = self
			.records
			.get(&host)
			.and_then(|record| record.outputs.iter().find(|(name, _, _)| &**name == output))
			.map(|(_, statement, owner)| (statement.clone(), *owner))
			.ok_or_else(|| Error::Reference(format!("$output.{}", output)))?;
		self.run_function(owner, host, &statement, value)
	}

	pub fn queue_render(&mut self, id: InstanceId) {
		self.instance_mut(id).render_queued = true;
		self.scheduler.schedule(id, Pass::Render, self.settings.debounce);
	}

	pub fn clear_render_queue(&mut self, id: InstanceId) {
		self.instance_mut(id).render_queued = false;
		self.scheduler.cancel(id, Pass::Render);
	}

	pub fn queue_css_render(&mut self, id: InstanceId) {
		self.instance_mut(id).css_queued = true;
		self.scheduler.schedule(id, Pass::Css, self.settings.css_debounce);
	}

	pub fn clear_css_render_queue(&mut self, id: InstanceId) {
		self.instance_mut(id).css_queued = false;
		self.scheduler.cancel(id, Pass::Css);
	}

	/// Moves the clock forward by `by`, delivering attribute mutations and firing every timer that comes due.
	///
	/// Returns how many timers fired.
	///
	/// # Errors
	///
	/// [`Error::Unsettled`] iff more timers fired than [`Settings::max_firings`] allows.
	pub fn advance(&mut self, by: Duration) -> Result<usize> {
		let until = self.scheduler.now() + by;
		let mut fired = 0;
		loop {
			self.deliver_mutations();
			let Some((id, pass)) = self.scheduler.pop_due(until) else { break };
			self.fire(id, pass);
			fired += 1;
			if fired >= self.settings.max_firings {
				return Err(Error::Unsettled(fired));
			}
		}
		self.scheduler.advance_to(until);
		Ok(fired)
	}

	/// Fires timers until none are left.
	pub fn run_until_idle(&mut self) -> Result<usize> {
		let mut fired = 0;
		loop {
			self.deliver_mutations();
			let Some(deadline) = self.scheduler.next_deadline() else { break };
			let Some((id, pass)) = self.scheduler.pop_due(deadline) else { break };
			self.fire(id, pass);
			fired += 1;
			if fired >= self.settings.max_firings {
				return Err(Error::Unsettled(fired));
			}
		}
		Ok(fired)
	}

	fn fire(&mut self, id: InstanceId, pass: Pass) {
		match pass {
			Pass::Render => {
				self.instance_mut(id).render_queued = false;
				self.render(id, false);
			}
			Pass::Css => {
				self.instance_mut(id).css_queued = false;
				self.css_render(id);
			}
		}
	}

	/// Renders `id` now. Without `force`, a queued, running or detached instance is skipped.
	///
	/// Returns whether a render pass completed without error.
	#[instrument(skip(self))]
	pub fn render(&mut self, id: InstanceId, force: bool) -> bool {
		let host = self.host(id);
		let connected = self.document.is_connected(host);
		let instance = self.instance(id);
		if !force && (instance.render_queued || instance.rendering || !connected) {
			if !connected {
				if !instance.rendered && self.pending_first_renders.remove(&id) {
					self.check_ready();
				}
				self.emit_event(host, "loadfinished");
			}
			return false;
		}
		if instance.parent.map_or(false, |parent| self.instance(parent).rendering) {
			trace!("Parent is rendering, requeued");
			self.queue_render(id);
			return false;
		}
		self.clear_render_queue(id);
		self.instance_mut(id).rendering = true;

		let body = self.document.body();
		let selector = &self.instance(id).selector;
		if selector.is_empty() || self.document.query_selector(body, selector).ok().flatten() != Some(host) {
			self.set_css_scope(id);
		}

		self.hook(id, |behavior, cx| behavior.before_render(cx));
		let first = !self.instance(id).rendered;
		if first {
			self.hook(id, |behavior, cx| behavior.before_first_render(cx));
			self.emit_event(host, "firstrender");
		} else {
			self.emit_event(host, "render");
		}

		let ok = match self.render_passes(id, first) {
			Ok(waiting) => {
				let result = Ok(());
				self.hook(id, |behavior, cx| behavior.after_render(cx, &result));
				self.wait_for_load(id, waiting);
				if first {
					self.hook(id, |behavior, cx| behavior.after_first_render(cx, &result));
					self.emit_event(host, "firstrendered");
					self.pending_first_renders.remove(&id);
					self.instance_mut(id).rendered = true;
					self.document.set_attribute(host, READY_ATTRIBUTE, "1");
					self.check_ready();
				} else {
					self.emit_event(host, "rendered");
				}
				true
			}
			Err(error) => {
				error!(%error, "There was an error during rendering");
				let result = Err(error);
				self.hook(id, |behavior, cx| behavior.after_render(cx, &result));
				false
			}
		};
		self.instance_mut(id).rendering = false;
		ok
	}

	/// Returns the child instances the first render has to wait for.
	fn render_passes(&mut self, id: InstanceId, first: bool) -> Result<Vec<InstanceId>> {
		let host = self.host(id);
		let class = self.instance(id).class.clone();
		let mut ancestor = self.document.parent(host);
		while let Some(node) = ancestor {
			if self.document.tag_name(node) == Some(class.tag()) {
				return Err(Error::RecursiveComponent(class.tag().to_owned()));
			}
			ancestor = self.document.parent(node);
		}

		if first {
			let compiled = class.compiled_html();
			if self.instance(id).injected.is_none() {
				let light = self.document.children(host).to_vec();
				self.instance_mut(id).injected = Some(light);
			}
			self.document.set_inner_html(host, &compiled.html)?;
			self.assign_children(id, host, compiled)?;
			self.retrieve_bound_values(id);
			self.render_injected(id, host, None)?;
			if !self.instance(id).css_rendered {
				self.css_render(id);
			}
		}

		let children = self.instance(id).children.clone();
		for &child in &children {
			if let Err(error) = self.action_if(id, child) {
				error!(?child, %error, "Conditional failed");
			}
		}

		let for_nodes = self.instance(id).for_nodes.clone();
		for template in for_nodes {
			match self.action_for(id, template) {
				Ok(()) => (),
				Err(error @ Error::AnchorNotFound(_)) => return Err(error),
				Err(error) => error!(?template, %error, "Loop failed"),
			}
		}

		let waiting = self.discover_children(id, first)?;

		let unique = mem::take(&mut self.instance_mut(id).unique_children);
		for node in unique {
			self.setup_unique(id, node, false);
		}

		let children = self.instance(id).children.clone();
		for child in children {
			if self.should_remove_child(child) {
				let instance = self.instance_mut(id);
				instance.children.retain(|&c| c != child);
				instance.child_set.remove(&child);
				continue;
			}
			let owner = self.records.get(&child).and_then(|record| record.owner).unwrap_or(id);
			self.action_item(owner, child);
		}

		self.update_binds(id);
		Ok(waiting)
	}

	fn discover_children(&mut self, id: InstanceId, first: bool) -> Result<Vec<InstanceId>> {
		let host = self.host(id);
		let own = self.instance(id).class.tag_rc();
		let customs: Vec<NodeId> = self
			.document
			.descendants(host)
			.into_iter()
			.filter(|&node| self.is_component_element(node))
			.collect();
		let mut waiting = Vec::new();
		for node in customs {
			if self.document.tag_name(node) == Some(&*own) {
				return Err(Error::RecursiveComponent(own.to_string()));
			}
			let child = match self.instance_of(node) {
				Some(child) => child,
				None => self.upgrade(node, Some(id))?,
			};
			if self.instance(child).parent.is_none() {
				self.instance_mut(child).parent = Some(id);
			}
			if first && !self.instance(child).rendered {
				waiting.push(child);
			}
		}
		Ok(waiting)
	}

	/// Emits `loadfinished` on `id`'s host now, or once all of `waiting` emitted theirs.
	fn wait_for_load(&mut self, id: InstanceId, waiting: Vec<InstanceId>) {
		let host = self.host(id);
		if waiting.is_empty() {
			return self.emit_event(host, "loadfinished");
		}
		for child in waiting {
			if self.load_waits.increment_or_insert_with(id, || host).is_err() {
				error!(?id, "Too many children to wait for");
				continue;
			}
			let child_host = self.host(child);
			self.add_listener(child_host, "loadfinished", Handler::LoadFinished { waiter: id }, true);
		}
	}

	pub(crate) fn finish_load(&mut self, waiter: InstanceId) {
		if self.load_waits.weak_decrement(&waiter).is_err() {
			return error!(?waiter, "Load count underflow");
		}
		let finished: Vec<NodeId> = self.load_waits.drain_weak().map(|(_, host)| host).collect();
		for host in finished {
			self.emit_event(host, "loadfinished");
		}
	}

	fn check_ready(&mut self) {
		if self.ready || !self.pending_first_renders.is_empty() {
			return;
		}
		self.ready = true;
		info!("All components rendered");
		if let Some(on_ready) = self.settings.on_ready.as_mut() {
			on_ready();
		}
	}

	/// Stops an instance whose host is about to be freed, so that an unfinished first render
	/// no longer holds up readiness or a waiting parent.
	///
	/// Returns the detached light DOM the host had before its first render, which goes with it.
	pub(crate) fn retire(&mut self, id: InstanceId) -> Vec<NodeId> {
		self.clear_render_queue(id);
		self.clear_css_render_queue(id);
		if !self.instance(id).rendered {
			let host = self.host(id);
			self.emit_event(host, "loadfinished");
			if self.pending_first_renders.remove(&id) {
				self.check_ready();
			}
		}
		for instance in &mut self.instances {
			instance.binder.retain(|link| link.provider != id && !matches!(link.receiver, Receiver::Instance(receiver, _) if receiver == id));
		}
		let instance = self.instance_mut(id);
		instance.children.clear();
		instance.child_set.clear();
		instance.unique_children.clear();
		instance.unique_nodes.clear();
		instance.for_nodes.clear();
		instance.bound.clear();
		instance.to_bind.clear();
		instance.to_input.clear();
		instance.gets.clear();
		trace!(?id, "Retired");
		instance.injected.take().unwrap_or_default()
	}

	/// Rewrites and (re)inserts the instance's scoped style rules.
	#[instrument(skip(self))]
	pub fn css_render(&mut self, id: InstanceId) {
		if !self.document.is_connected(self.host(id)) {
			return trace!("Not connected, skipped");
		}
		self.clear_css_render_queue(id);
		self.hook(id, |behavior, cx| behavior.before_css_render(cx));
		let result = self.css_passes(id);
		if let Err(error) = &result {
			error!(%error, "There was an error during CSS rendering");
		}
		self.hook(id, |behavior, cx| behavior.after_css_render(cx, &result));
		if result.is_ok() {
			self.instance_mut(id).css_rendered = true;
		}
	}

	fn css_passes(&mut self, id: InstanceId) -> Result<()> {
		let class = self.instance(id).class.clone();
		let compiled = class.compiled_css();
		if class.claim_global_rules() {
			for rule in &compiled.global {
				self.stylesheet.push_rule(rule.to_string());
			}
		}
		if self.instance(id).css_rules.is_none() {
			let rules = compiled.scoped.iter().map(|rule| ScopedRule { rule: rule.clone(), index: None }).collect();
			self.instance_mut(id).css_rules = Some(rules);
		}

		let mut executables: Vec<_> = compiled.executables.iter().collect();
		executables.sort_by_key(|(placeholder, _)| core::cmp::Reverse(placeholder.len()));
		let selector = self.instance(id).selector.clone();
		let rules = self.instance(id).css_rules.clone().unwrap_or_default();
		for (position, scoped) in rules.iter().enumerate() {
			let mut text = scoped.rule.replace("@self", &selector);
			for (placeholder, directive) in &executables {
				if text.contains(&***placeholder) {
					let value = self.execute_css(id, &directive.value)?;
					text = text.replace(&***placeholder, &value.to_js_string());
				}
			}
			match scoped.index {
				Some(index) => self.stylesheet.replace_rule(index, text)?,
				None => {
					let index = self.stylesheet.push_rule(text);
					if let Some(slot) = self.instance_mut(id).css_rules.as_mut().and_then(|rules| rules.get_mut(position)) {
						slot.index = Some(index);
					}
				}
			}
		}
		Ok(())
	}

	/// The parameters of a template expression evaluated for `node` on behalf of `owner`.
	///
	/// Later entries shadow earlier ones, so the loop variables win over scopes, which win over state.
	pub(crate) fn frame(&self, owner: InstanceId, node: NodeId, event: Option<Value>) -> Frame {
		let mut frame = Frame::new();
		if let Some(event) = event {
			frame.push("$event", event);
		}
		let instance = self.instance(owner);
		for method in &instance.methods {
			frame.push(method.clone(), Value::Callable(Callable::Method(method.clone())));
		}
		for (field, value) in instance.state.iter() {
			frame.push(field.clone(), value.clone());
		}
		frame.push("$", instance.state.to_value());

		let record = self.records.get(&node);
		if let Some(record) = record {
			for (name, value) in record.scope.iter() {
				frame.push(name.clone(), value.clone());
			}
			for (name, value) in self.injected_scopes(record.injected_parent).iter() {
				frame.push(name.clone(), value.clone());
			}
		}
		let for_box = record.map(|record| &record.for_box);
		let key_name = for_box.and_then(|b| b.key_name.clone()).unwrap_or_else(|| "$key".into());
		let value_name = for_box.and_then(|b| b.value_name.clone()).unwrap_or_else(|| "$value".into());
		frame.push(key_name, for_box.map_or(Value::Null, |b| b.key.clone()));
		frame.push(value_name, for_box.map_or(Value::Null, |b| b.value.clone()));
		frame.push("$node", Value::Node(node));
		frame
	}

	/// Scopes of the hosts a node was injected through, innermost last.
	fn injected_scopes(&self, mut current: Option<InstanceId>) -> Object {
		let mut chain = Vec::new();
		while let Some(instance) = current {
			if chain.len() > self.instances.len() {
				break;
			}
			let record = self.records.get(&self.host(instance));
			chain.push(record.map(|record| &record.scope));
			current = record.and_then(|record| record.injected_parent);
		}
		let mut scope = Object::new();
		for entries in chain.into_iter().rev().flatten() {
			for (name, value) in entries.iter() {
				scope.insert(name.clone(), value.clone());
			}
		}
		scope
	}

	fn css_frame(&self, id: InstanceId) -> Frame {
		let mut frame = Frame::new();
		let instance = self.instance(id);
		for method in &instance.methods {
			frame.push(method.clone(), Value::Callable(Callable::Method(method.clone())));
		}
		for (field, value) in instance.css.iter() {
			frame.push(field.clone(), value.clone());
		}
		frame.push("$css", instance.css.to_value());
		frame
	}

	/// Evaluates a template expression.
	pub(crate) fn execute(&mut self, owner: InstanceId, node: NodeId, source: &str) -> Result<Value> {
		let mut frame = self.frame(owner, node, None);
		let program = self.programs.program(ProgramKind::Expression, &frame.shape(), source)?;
		evaluate(&program, &mut frame, &mut MethodHost { runtime: self, owner })
	}

	fn execute_css(&mut self, owner: InstanceId, source: &str) -> Result<Value> {
		let mut frame = self.css_frame(owner);
		let program = self.programs.program(ProgramKind::Expression, &frame.shape(), source)?;
		evaluate(&program, &mut frame, &mut MethodHost { runtime: self, owner })
	}

	/// Runs handler statements with `$event` bound, then writes reassigned state fields back.
	pub(crate) fn run_function(&mut self, owner: InstanceId, node: NodeId, source: &str, event: Value) -> Result<Value> {
		let mut frame = self.frame(owner, node, Some(event));
		let before: Vec<Value> = frame.iter().map(|(_, value)| value.clone()).collect();
		let program = self.programs.program(ProgramKind::Statements, &frame.shape(), source)?;
		let result = evaluate(&program, &mut frame, &mut MethodHost { runtime: self, owner })?;
		self.write_back(owner, &frame, &before)?;
		Ok(result)
	}

	fn write_back(&mut self, owner: InstanceId, frame: &Frame, before: &[Value]) -> Result<()> {
		let skipped = |value: &Value| matches!(value, Value::Undefined | Value::Callable(_)) || matches!(value, Value::Number(n) if n.is_nan());
		let state = &self.instance(owner).state;
		let changes: Vec<(Rc<str>, Value)> = frame
			.iter()
			.zip(before)
			.filter(|((name, after), before)| {
				!name.starts_with('$')
					&& state.get(name).map_or(false, |current| !skipped(current))
					&& !skipped(after)
					&& !before.strict_eq(after)
			})
			.map(|((name, after), _)| (name.clone(), after.clone()))
			.collect();
		for (name, value) in changes {
			self.set_state(owner, &name, value)?;
		}
		Ok(())
	}
}

/// Lets expressions reach the methods and state of the instance they belong to.
struct MethodHost<'a> {
	runtime: &'a mut Runtime,
	owner: InstanceId,
}

impl Host for MethodHost<'_> {
	fn call_method(&mut self, name: &str, arguments: Vec<Value>) -> Result<Value> {
		self.runtime.call_method(self.owner, name, &arguments)
	}

	fn set_state(&mut self, field: &str, value: Value) -> Result<()> {
		self.runtime.set_state(self.owner, field, value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Plain;
	impl Lifecycle for Plain {}

	#[test]
	fn one_per_thread() {
		let runtime = Runtime::new(Settings::new()).unwrap();
		assert_eq!(Runtime::new(Settings::new()).unwrap_err(), Error::RuntimeExists);
		drop(runtime);
		Runtime::new(Settings::new()).unwrap();
	}

	#[test]
	fn registration() {
		let mut runtime = Runtime::new(Settings::new()).unwrap();
		assert_eq!(
			runtime.register("plain", "", "", || Box::new(Plain)),
			Err(Error::InvalidTagName("plain".to_owned()))
		);
		runtime.register("x-plain", "", "", || Box::new(Plain)).unwrap();
		assert_eq!(
			runtime.register("x-plain", "", "", || Box::new(Plain)),
			Err(Error::AlreadyRegistered("x-plain".to_owned()))
		);
		assert_eq!(runtime.stylesheet().len(), 2);
		assert_eq!(
			runtime.stylesheet().rule(0),
			Some("x-plain:not([dito-ready]):not([dito-show]) {opacity: 0;}")
		);
	}

	#[test]
	fn scope_selector() {
		let mut runtime = Runtime::new(Settings::new()).unwrap();
		runtime.register("x-outer", "<x-inner></x-inner>", "", || Box::new(Plain)).unwrap();
		runtime.register("x-inner", "", "", || Box::new(Plain)).unwrap();
		let body = runtime.document().body();
		runtime.mount(body, "<p></p><x-outer></x-outer>").unwrap();
		runtime.run_until_idle().unwrap();

		let outer = runtime.instance_of(runtime.document().element_children(body).nth(1).unwrap()).unwrap();
		assert_eq!(runtime.scope_selector(outer), Some("x-outer[dito-i=\"1\"][dito-t=\"0\"]"));
		let inner_host = runtime.document().elements_by_tag_name(body, "x-inner")[0];
		let inner = runtime.instance_of(inner_host).unwrap();
		assert_eq!(runtime.parent(inner), Some(outer));
		assert_eq!(
			runtime.scope_selector(inner),
			Some("x-outer[dito-i=\"1\"][dito-t=\"0\"] x-inner[dito-i=\"0\"][dito-t=\"10\"]")
		);
		let selector = runtime.scope_selector(inner).unwrap().to_owned();
		assert_eq!(runtime.document().query_selector(body, &selector).unwrap(), Some(inner_host));
	}
}
