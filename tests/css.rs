use dito::{Context, Lifecycle, Runtime, Settings, Value};
use pretty_assertions::assert_eq;

struct Styled;

impl Lifecycle for Styled {
	fn init(&mut self, cx: &mut Context<'_>) {
		cx.set_css("color", "red").unwrap();
	}
}

fn styled() -> Runtime {
	let mut runtime = Runtime::new(Settings::new()).unwrap();
	runtime
		.register("x-css", "<p>x</p>", "@self p { color: {{ color }}; } body { margin: 0; }", || Box::new(Styled))
		.unwrap();
	let body = runtime.document().body();
	runtime.mount(body, "<x-css></x-css><x-css></x-css>").unwrap();
	runtime.run_until_idle().unwrap();
	runtime
}

#[test]
fn rules_are_scoped_per_instance() {
	let runtime = styled();
	assert_eq!(
		runtime.stylesheet().rules()[2..].to_vec(),
		vec![
			"body { margin: 0; }".to_owned(),
			r#"x-css[dito-i="0"][dito-t="0"] p { color: red; }"#.to_owned(),
			r#"x-css[dito-i="1"][dito-t="0"] p { color: red; }"#.to_owned(),
		]
	);
}

#[test]
fn css_variables_rerender_in_place() {
	let mut runtime = styled();
	let body = runtime.document().body();
	let first = runtime.instance_of(runtime.document().elements_by_tag_name(body, "x-css")[0]).unwrap();
	let rules = runtime.stylesheet().len();

	runtime.set_css(first, "color", Value::from("blue")).unwrap();
	assert_eq!(runtime.css_var(first, "color"), Some(&Value::from("blue")));
	runtime.run_until_idle().unwrap();

	assert_eq!(runtime.stylesheet().len(), rules);
	assert_eq!(runtime.stylesheet().rule(3), Some(r#"x-css[dito-i="0"][dito-t="0"] p { color: blue; }"#));
	assert_eq!(runtime.stylesheet().rule(4), Some(r#"x-css[dito-i="1"][dito-t="0"] p { color: red; }"#));
}

#[test]
fn scope_selectors_match_their_host() {
	let runtime = styled();
	let body = runtime.document().body();
	for host in runtime.document().elements_by_tag_name(body, "x-css") {
		let id = runtime.instance_of(host).unwrap();
		let selector = runtime.scope_selector(id).unwrap();
		assert_eq!(runtime.document().query_selector(body, selector), Ok(Some(host)));
		assert_eq!(runtime.document().get_attribute(host, "dito-ready"), Some("1"));
	}
}
