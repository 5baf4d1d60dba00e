use dito::{Context, Lifecycle, NodeId, Runtime, Settings, Value};
use pretty_assertions::assert_eq;

struct Plain;
impl Lifecycle for Plain {}

fn plain() -> Box<dyn Lifecycle> {
	Box::new(Plain)
}

fn text_of(runtime: &Runtime, root: NodeId, tag: &str) -> String {
	let node = runtime.document().elements_by_tag_name(root, tag)[0];
	runtime.document().text_content(node)
}

#[test]
fn light_dom_is_injected() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-card", "<header><dito-inject></dito-inject></header><footer>end</footer>", "", plain).unwrap();
	let body = runtime.document().body();
	let card = runtime.mount(body, "<x-card><b>hi</b></x-card>").unwrap()[0];
	runtime.run_until_idle().unwrap();

	assert_eq!(text_of(&runtime, card, "header"), "hi");
	assert!(runtime.document().elements_by_tag_name(card, "dito-inject").is_empty());
	assert_eq!(runtime.document().text_content(card), "hiend");
}

#[test]
fn injected_content_stays_reactive_in_its_owner() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-page", "<x-card><b>{{ msg }}</b></x-card>", "", plain).unwrap();
	runtime.register("x-card", "<header><dito-inject></dito-inject></header>", "", plain).unwrap();
	let body = runtime.document().body();
	let page = runtime.mount(body, "<x-page></x-page>").unwrap()[0];
	let id = runtime.instance_of(page).unwrap();
	runtime.set_state(id, "msg", Value::from("hello")).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(text_of(&runtime, page, "header"), "hello");

	runtime.set_state(id, "msg", Value::from("bye")).unwrap();
	runtime.run_until_idle().unwrap();
	assert_eq!(text_of(&runtime, page, "header"), "bye");
	assert_eq!(runtime.document().elements_by_tag_name(page, "b").len(), 1);
}

#[test]
fn packs_pick_their_templates() {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-page", r#"<x-card><a @pack="'nav'">N</a><p @pack="'main'">M</p><i>dropped</i></x-card>"#, "", plain)
		.unwrap();
	runtime
		.register(
			"x-card",
			r#"<nav><dito-inject @pack="'nav'"></dito-inject></nav><main><dito-inject @pack="'main'"></dito-inject></main>"#,
			"",
			plain,
		)
		.unwrap();
	let body = runtime.document().body();
	let page = runtime.mount(body, "<x-page></x-page>").unwrap()[0];
	runtime.run_until_idle().unwrap();

	assert_eq!(text_of(&runtime, page, "nav"), "N");
	assert_eq!(text_of(&runtime, page, "main"), "M");
	assert!(runtime.document().elements_by_tag_name(page, "i").is_empty());
}

#[test]
fn use_exposes_a_value_to_the_injected_content() {
	struct Card;
	impl Lifecycle for Card {
		fn init(&mut self, cx: &mut Context<'_>) {
			cx.set("label", "hey").unwrap();
		}
	}

	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-page", r#"<x-card><b @uname="l">{{ l }}</b></x-card>"#, "", plain).unwrap();
	runtime
		.register("x-card", r#"<dito-inject @use="label"></dito-inject>"#, "", || Box::new(Card))
		.unwrap();
	let body = runtime.document().body();
	let page = runtime.mount(body, "<x-page></x-page>").unwrap()[0];
	runtime.run_until_idle().unwrap();

	assert_eq!(text_of(&runtime, page, "b"), "hey");
}
