#![cfg(target_arch = "wasm32")]

use dito::{load, Lifecycle, Runtime, Settings, Value};
use std::sync::Once;
use wasm_bindgen::JsCast;
use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
use web_sys::{window, HtmlBodyElement, Node};

wasm_bindgen_test_configure!(run_in_browser);

static LOG: Once = Once::new();

struct Plain;
impl Lifecycle for Plain {}

#[wasm_bindgen_test]
fn load_render_materialize() {
	LOG.call_once(tracing_wasm::set_as_global_default);

	let body = window().unwrap().document().unwrap().body().unwrap().dyn_into::<HtmlBodyElement>().unwrap();
	body.set_inner_html(r#"<x-greeting title="web"></x-greeting><!--after-->"#);

	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime.register("x-greeting", "<p>Hello {{ who }}!</p>", "", || Box::new(Plain)).unwrap();
	let arena_body = runtime.document().body();
	let live: &Node = body.as_ref();
	let loaded = load::load_child_nodes(runtime.document_mut(), arena_body, &live.child_nodes()).unwrap();
	assert_eq!(loaded.len(), 2);

	let host = loaded[0];
	runtime.upgrade_subtree(host).unwrap();
	let id = runtime.instance_of(host).unwrap();
	runtime.set_state(id, "who", Value::from("web")).unwrap();
	runtime.run_until_idle().unwrap();

	load::materialize_children(runtime.document(), arena_body, &body).unwrap();
	let element = body.first_element_child().unwrap();
	assert_eq!(element.local_name(), "x-greeting");
	assert_eq!(element.get_attribute("title").as_deref(), Some("web"));
	assert_eq!(element.get_attribute("dito-ready").as_deref(), Some("1"));
	let element: &Node = element.as_ref();
	assert_eq!(element.text_content().as_deref(), Some("Hello web!"));
	assert_eq!(body.child_element_count(), 1);
}
