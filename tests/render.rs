use core::time::Duration;
use dito::{Context, DefaultKind, Defaults, Error, InstanceId, Lifecycle, NodeId, Runtime, Settings, Value};
use pretty_assertions::assert_eq;
use std::{
	cell::{Cell, RefCell},
	rc::Rc,
};

struct Plain;
impl Lifecycle for Plain {}

fn plain() -> Box<dyn Lifecycle> {
	Box::new(Plain)
}

fn mount(runtime: &mut Runtime, html: &str) -> (NodeId, InstanceId) {
	let body = runtime.document().body();
	let host = runtime.mount(body, html).unwrap()[0];
	(host, runtime.instance_of(host).unwrap())
}

fn first(runtime: &Runtime, root: NodeId, tag: &str) -> NodeId {
	runtime.document().elements_by_tag_name(root, tag)[0]
}

#[test]
fn executables() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-text", "<p>{{ n }}</p><i>{{ 1/0 }}</i><b>{{ $.missing }}</b><s>{{ nope }}</s>", "", plain)
		.unwrap();
	let (host, id) = mount(&mut runtime, "<x-text></x-text>");
	runtime.set_state(id, "n", Value::from(0)).unwrap();
	runtime.run_until_idle().unwrap();

	let document = runtime.document();
	assert_eq!(document.text_content(first(&runtime, host, "p")), "0");
	assert_eq!(document.text_content(first(&runtime, host, "i")), "Infinity");
	assert_eq!(document.text_content(first(&runtime, host, "b")), "");
	assert_eq!(document.text_content(first(&runtime, host, "s")), "");
	assert!(runtime.is_rendered(id));
	assert_eq!(document.get_attribute(host, "dito-ready"), Some("1"));
}

#[test]
fn renders_are_coalesced() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-count", "<p>{{ n }}</p>", "", plain).unwrap();
	let (host, id) = mount(&mut runtime, "<x-count></x-count>");
	runtime.set_state(id, "n", Value::from(0)).unwrap();
	runtime.run_until_idle().unwrap();

	let renders = Rc::new(Cell::new(0));
	runtime.add_event_listener(host, "render", {
		let renders = renders.clone();
		move |_| renders.set(renders.get() + 1)
	});
	for n in 1..=3 {
		runtime.set_state(id, "n", Value::from(n)).unwrap();
	}
	assert_eq!(runtime.run_until_idle(), Ok(1));
	assert_eq!(renders.get(), 1);
	assert_eq!(runtime.document().text_content(first(&runtime, host, "p")), "3");

	// Unchanged values don't schedule anything.
	runtime.set_state(id, "n", Value::from(3)).unwrap();
	assert_eq!(runtime.run_until_idle(), Ok(0));
}

#[test]
fn debounce_restarts() {
	let mut runtime = Runtime::new(Settings::new().debounce(Duration::from_millis(50))).unwrap();
	runtime.register("x-slow", "<p>{{ n }}</p>", "", plain).unwrap();
	let (host, id) = mount(&mut runtime, "<x-slow></x-slow>");
	runtime.run_until_idle().unwrap();
	assert_eq!(runtime.now(), Duration::from_millis(50));

	runtime.set_state(id, "n", Value::from(1)).unwrap();
	assert_eq!(runtime.advance(Duration::from_millis(40)), Ok(0));
	runtime.set_state(id, "n", Value::from(2)).unwrap();
	assert_eq!(runtime.advance(Duration::from_millis(30)), Ok(0));
	assert_eq!(runtime.document().text_content(first(&runtime, host, "p")), "");
	assert_eq!(runtime.advance(Duration::from_millis(10)), Ok(1));
	assert_eq!(runtime.document().text_content(first(&runtime, host, "p")), "2");
}

#[test]
fn templates_compile_once() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-a", "<p @if=\"true\">{{ 1 }}</p>", "@self p { margin: 0; }", plain).unwrap();
	let body = runtime.document().body();
	runtime.mount(body, "<x-a></x-a><x-a></x-a><x-a></x-a>").unwrap();
	runtime.run_until_idle().unwrap();

	assert_eq!(runtime.class("x-a").unwrap().compilations(), 2);
	for host in runtime.document().elements_by_tag_name(body, "x-a") {
		assert_eq!(runtime.document().text_content(host), "1");
	}
}

#[test]
fn conditionals_keep_node_identity() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-if", "<p @if=\"show\">hi</p>", "", plain).unwrap();
	let (host, id) = mount(&mut runtime, "<x-if></x-if>");
	runtime.set_state(id, "show", Value::from(true)).unwrap();
	runtime.run_until_idle().unwrap();
	let p = first(&runtime, host, "p");

	runtime.set_state(id, "show", Value::from(false)).unwrap();
	runtime.run_until_idle().unwrap();
	assert!(runtime.document().elements_by_tag_name(host, "p").is_empty());
	assert_eq!(runtime.document().text_content(host), "");

	runtime.set_state(id, "show", Value::from(true)).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(first(&runtime, host, "p"), p);
	assert_eq!(runtime.document().parent(p), Some(host));
	assert_eq!(runtime.document().text_content(host), "hi");
}

#[test]
fn attributes() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-attr", r#"<img @a:src="picture" @a:alt="'a ' + picture">"#, "", plain)
		.unwrap();
	let (host, id) = mount(&mut runtime, "<x-attr></x-attr>");
	runtime.set_state(id, "picture", Value::Null).unwrap();
	runtime.run_until_idle().unwrap();
	let img = first(&runtime, host, "img");
	assert_eq!(runtime.document().get_attribute(img, "src"), Some(""));
	assert_eq!(runtime.document().get_attribute(img, "alt"), Some("a null"));

	runtime.set_state(id, "picture", Value::from("cat.png")).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(runtime.document().get_attribute(img, "src"), Some("cat.png"));
}

struct Counter;

impl Lifecycle for Counter {
	fn init(&mut self, cx: &mut Context<'_>) {
		cx.set("count", 0).unwrap();
		cx.set("last", "").unwrap();
	}

	fn methods(&self) -> &'static [&'static str] {
		&["add"]
	}

	fn call(&mut self, cx: &mut Context<'_>, method: &str, arguments: &[Value]) -> dito::Result<Value> {
		assert_eq!(method, "add");
		let count = cx.get("count").to_number() + arguments[0].to_number();
		cx.set("count", count)?;
		Ok(Value::from(count))
	}
}

#[test]
fn events() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register(
			"x-events",
			r#"<button @e:click="count = count + 1; last = $event.type">{{ count }}</button><a @e:click="add(2)"></a>"#,
			"",
			|| Box::new(Counter),
		)
		.unwrap();
	let body = runtime.document().body();
	let (host, id) = mount(&mut runtime, "<x-events></x-events>");

	let bubbled = Rc::new(Cell::new(0));
	runtime.add_event_listener(body, "click", {
		let bubbled = bubbled.clone();
		move |event| {
			assert_eq!(&*event.name, "click");
			bubbled.set(bubbled.get() + 1);
		}
	});
	let lifecycle = Rc::new(Cell::new(0));
	runtime.add_event_listener(body, "firstrendered", {
		let lifecycle = lifecycle.clone();
		move |_| lifecycle.set(lifecycle.get() + 1)
	});
	runtime.run_until_idle().unwrap();
	assert_eq!(lifecycle.get(), 0, "engine events don't bubble");

	let button = first(&runtime, host, "button");
	runtime.dispatch_event(button, "click");
	runtime.run_until_idle().unwrap();
	assert_eq!(runtime.document().text_content(button), "1");
	assert_eq!(runtime.state(id, "last"), Some(&Value::from("click")));

	let a = first(&runtime, host, "a");
	runtime.dispatch_event(a, "click");
	runtime.run_until_idle().unwrap();
	assert_eq!(runtime.document().text_content(button), "3");
	assert_eq!(bubbled.get(), 2);
}

#[test]
fn defaults() {
	struct Card;
	impl Lifecycle for Card {
		fn defaults(&self) -> Defaults {
			Defaults::new()
				.append("class", "card")
				.replace("role", "note")
				.add("data-n", "1")
				.with_kind("title", "x", DefaultKind::Replace)
		}
	}

	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-card", "", "", || Box::new(Card)).unwrap();
	let (host, _) = mount(&mut runtime, r#"<x-card class="big" role="x" data-n="0"></x-card>"#);
	let document = runtime.document();
	assert_eq!(document.get_attribute(host, "class"), Some("big card"));
	assert_eq!(document.get_attribute(host, "role"), Some("note"));
	assert_eq!(document.get_attribute(host, "data-n"), Some("01"));
	assert_eq!(document.get_attribute(host, "title"), Some("x"));
}

struct Logger(Rc<RefCell<Vec<&'static str>>>);

impl Lifecycle for Logger {
	fn prepare(&mut self, _: &mut Context<'_>) {
		self.0.borrow_mut().push("prepare");
	}
	fn init(&mut self, cx: &mut Context<'_>) {
		self.0.borrow_mut().push("init");
		cx.set("n", 0).unwrap();
	}
	fn before_render(&mut self, _: &mut Context<'_>) {
		self.0.borrow_mut().push("before_render");
	}
	fn before_first_render(&mut self, _: &mut Context<'_>) {
		self.0.borrow_mut().push("before_first_render");
	}
	fn after_render(&mut self, _: &mut Context<'_>, result: &dito::Result<()>) {
		assert_eq!(result, &Ok(()));
		self.0.borrow_mut().push("after_render");
	}
	fn after_first_render(&mut self, _: &mut Context<'_>, _: &dito::Result<()>) {
		self.0.borrow_mut().push("after_first_render");
	}
	fn before_css_render(&mut self, _: &mut Context<'_>) {
		self.0.borrow_mut().push("before_css_render");
	}
	fn after_css_render(&mut self, _: &mut Context<'_>, _: &dito::Result<()>) {
		self.0.borrow_mut().push("after_css_render");
	}
}

#[test]
fn hook_order() {
	let log = Rc::new(RefCell::new(Vec::new()));
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-log", "{{ n }}", "", {
			let log = log.clone();
			move || -> Box<dyn Lifecycle> { Box::new(Logger(log.clone())) }
		})
		.unwrap();
	let (_, id) = mount(&mut runtime, "<x-log></x-log>");
	runtime.run_until_idle().unwrap();
	assert_eq!(
		*log.borrow(),
		vec![
			"prepare",
			"init",
			"before_render",
			"before_first_render",
			"before_css_render",
			"after_css_render",
			"after_render",
			"after_first_render",
		]
	);

	log.borrow_mut().clear();
	runtime.set_state(id, "n", Value::from(1)).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(*log.borrow(), vec!["before_render", "after_render"]);
}

#[test]
fn recursion_is_an_error() {
	struct Recorder(Rc<RefCell<Option<dito::Result<()>>>>);
	impl Lifecycle for Recorder {
		fn after_render(&mut self, _: &mut Context<'_>, result: &dito::Result<()>) {
			*self.0.borrow_mut() = Some(result.clone());
		}
	}

	let result = Rc::new(RefCell::new(None));
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-loop", "<x-loop></x-loop>", "", {
			let result = result.clone();
			move || -> Box<dyn Lifecycle> { Box::new(Recorder(result.clone())) }
		})
		.unwrap();
	let (_, id) = mount(&mut runtime, "<x-loop></x-loop>");
	runtime.run_until_idle().unwrap();
	assert_eq!(*result.borrow(), Some(Err(Error::RecursiveComponent("x-loop".to_owned()))));
	assert!(!runtime.is_rendered(id));
}

#[test]
fn runaway_renders_are_reported() {
	struct Restless;
	impl Lifecycle for Restless {
		fn after_render(&mut self, cx: &mut Context<'_>, _: &dito::Result<()>) {
			let n = cx.get("n").to_number();
			cx.set("n", if n.is_nan() { 0.0 } else { n + 1.0 }).unwrap();
		}
	}

	let mut runtime = Runtime::new(Settings::new().max_firings(3)).unwrap();
	runtime.register("x-restless", "", "", || Box::new(Restless)).unwrap();
	mount(&mut runtime, "<x-restless></x-restless>");
	assert_eq!(runtime.run_until_idle(), Err(Error::Unsettled(3)));
}

#[test]
fn ready_waits_for_nested_components() {
	let ready = Rc::new(Cell::new(0));
	let settings = Settings::new().on_ready({
		let ready = ready.clone();
		move || ready.set(ready.get() + 1)
	});
	let mut runtime = Runtime::new(settings).unwrap();
	runtime.register("x-outer", "<x-inner></x-inner>", "", plain).unwrap();
	runtime.register("x-inner", "<i>in</i>", "", plain).unwrap();
	let (host, outer) = mount(&mut runtime, "<x-outer></x-outer>");

	runtime.advance(Duration::from_millis(10)).unwrap();
	assert!(runtime.is_rendered(outer));
	assert!(!runtime.is_ready());
	assert_eq!(ready.get(), 0);

	runtime.advance(Duration::from_millis(10)).unwrap();
	assert!(runtime.is_ready());
	assert_eq!(ready.get(), 1);
	assert_eq!(runtime.document().text_content(host), "in");

	let loaded = Rc::new(Cell::new(0));
	runtime.add_event_listener(host, "loadfinished", {
		let loaded = loaded.clone();
		move |_| loaded.set(loaded.get() + 1)
	});
	runtime.queue_render(outer);
	runtime.run_until_idle().unwrap();
	assert_eq!(loaded.get(), 1);
	assert_eq!(ready.get(), 1);
}

#[test]
fn detached_instances_do_not_block_readiness() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-gone", "<p></p>", "", plain).unwrap();
	let (host, id) = mount(&mut runtime, "<x-gone></x-gone>");
	runtime.document_mut().remove(host);
	runtime.run_until_idle().unwrap();
	assert!(!runtime.is_rendered(id));
	assert!(runtime.is_ready());
}

#[test]
fn child_render_waits_for_a_rendering_parent() {
	type Log = Rc<RefCell<Vec<String>>>;

	struct Parent(Log);
	impl Lifecycle for Parent {
		fn before_render(&mut self, cx: &mut Context<'_>) {
			self.0.borrow_mut().push("parent".to_owned());
			if !cx.get("nested").is_truthy() {
				return;
			}
			let host = cx.document().elements_by_tag_name(cx.node(), "x-child")[0];
			let runtime = cx.runtime();
			let child = runtime.instance_of(host).unwrap();
			let rendered = runtime.render(child, false);
			self.0.borrow_mut().push(format!("nested render: {rendered}"));
		}
		fn after_render(&mut self, _: &mut Context<'_>, _: &dito::Result<()>) {
			self.0.borrow_mut().push("parent done".to_owned());
		}
	}

	struct Child(Log);
	impl Lifecycle for Child {
		fn before_render(&mut self, _: &mut Context<'_>) {
			self.0.borrow_mut().push("child".to_owned());
		}
	}

	let log = Log::default();
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	let parent_log = log.clone();
	runtime
		.register("x-parent", "<x-child></x-child>", "", move || Box::new(Parent(parent_log.clone())))
		.unwrap();
	let child_log = log.clone();
	runtime.register("x-child", "", "", move || Box::new(Child(child_log.clone()))).unwrap();
	let (_, id) = mount(&mut runtime, "<x-parent></x-parent>");
	runtime.run_until_idle().unwrap();
	assert_eq!(*log.borrow(), ["parent", "parent done", "child"]);
	log.borrow_mut().clear();

	runtime.set_state(id, "nested", Value::from(true)).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(*log.borrow(), ["parent", "nested render: false", "parent done", "child"]);
}
