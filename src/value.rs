//! Dynamically typed values as seen by template expressions.
//!
//! Conversions and comparisons follow the ECMAScript rules the templates are written against,
//! so that `{{ 1/0 }}` renders `Infinity` and `[] !== []` holds.

use crate::dom::NodeId;
use indexmap::IndexMap;
use core::fmt::{self, Display, Formatter};
use std::rc::Rc;

/// A template-visible value.
///
/// [`PartialEq`] is *structural* and meant for Rust-side assertions.
/// Use [`Value::strict_eq`] for the identity-based comparison the engine uses for change detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
	#[default]
	Undefined,
	Null,
	Bool(bool),
	Number(f64),
	String(Rc<str>),
	Array(Rc<Vec<Value>>),
	Object(Rc<Object>),
	/// A live node of the runtime's [`Document`](`crate::Document`), e.g. `$node`.
	Node(NodeId),
	Callable(Callable),
}

/// Something an expression can call.
#[derive(Debug, Clone, PartialEq)]
pub enum Callable {
	/// A method of the component the expression is evaluated for.
	Method(Rc<str>),
	Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
	String,
	Number,
	Boolean,
	ParseInt,
	ParseFloat,
	IsNaN,
	MathFloor,
	MathCeil,
	MathRound,
	MathAbs,
	MathMin,
	MathMax,
}

/// An insertion-ordered string-keyed map, like a plain ECMAScript object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
	entries: IndexMap<Rc<str>, Value>,
}

impl Object {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<&Value> {
		self.entries.get(key)
	}

	/// Replaces an existing entry in place (keeping its position) or appends a new one.
	pub fn insert(&mut self, key: impl Into<Rc<str>>, value: impl Into<Value>) {
		self.entries.insert(key.into(), value.into());
	}

	/// Removes `key`, keeping the order of the remaining entries.
	pub fn remove(&mut self, key: &str) -> Option<Value> {
		self.entries.shift_remove(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> + '_ {
		self.entries.iter()
	}

	pub fn keys(&self) -> impl Iterator<Item = &Rc<str>> + '_ {
		self.entries.keys()
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

impl<K: Into<Rc<str>>, V: Into<Value>> FromIterator<(K, V)> for Object {
	fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
		let mut object = Self::new();
		for (k, v) in iter {
			object.insert(k, v);
		}
		object
	}
}

impl Value {
	#[must_use]
	pub fn string(s: impl Into<Rc<str>>) -> Self {
		Self::String(s.into())
	}

	#[must_use]
	pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
		Self::Array(Rc::new(items.into_iter().collect()))
	}

	#[must_use]
	pub fn object(object: Object) -> Self {
		Self::Object(Rc::new(object))
	}

	#[must_use]
	pub fn is_nullish(&self) -> bool {
		matches!(self, Self::Undefined | Self::Null)
	}

	#[must_use]
	pub fn is_truthy(&self) -> bool {
		match self {
			Self::Undefined | Self::Null => false,
			Self::Bool(b) => *b,
			Self::Number(n) => *n != 0.0 && !n.is_nan(),
			Self::String(s) => !s.is_empty(),
			Self::Array(_) | Self::Object(_) | Self::Node(_) | Self::Callable(_) => true,
		}
	}

	#[must_use]
	pub fn is_callable(&self) -> bool {
		matches!(self, Self::Callable(_))
	}

	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(s) => Some(s),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_number(&self) -> Option<f64> {
		match self {
			Self::Number(n) => Some(*n),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Bool(b) => Some(*b),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_array(&self) -> Option<&[Value]> {
		match self {
			Self::Array(items) => Some(items),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_object(&self) -> Option<&Object> {
		match self {
			Self::Object(object) => Some(object),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_node(&self) -> Option<NodeId> {
		match self {
			Self::Node(node) => Some(*node),
			_ => None,
		}
	}

	#[must_use]
	pub fn type_of(&self) -> &'static str {
		match self {
			Self::Undefined => "undefined",
			Self::Null | Self::Array(_) | Self::Object(_) | Self::Node(_) => "object",
			Self::Bool(_) => "boolean",
			Self::Number(_) => "number",
			Self::String(_) => "string",
			Self::Callable(_) => "function",
		}
	}

	/// ECMAScript `ToNumber`.
	#[must_use]
	pub fn to_number(&self) -> f64 {
		match self {
			Self::Undefined | Self::Object(_) | Self::Node(_) | Self::Callable(_) => f64::NAN,
			Self::Null => 0.0,
			Self::Bool(b) => f64::from(u8::from(*b)),
			Self::Number(n) => *n,
			Self::String(s) => string_to_number(s),
			Self::Array(items) => match items.as_slice() {
				[] => 0.0,
				[single] => Self::String(single.to_js_string().into()).to_number(),
				_ => f64::NAN,
			},
		}
	}

	/// ECMAScript `ToString`.
	#[must_use]
	pub fn to_js_string(&self) -> String {
		match self {
			Self::Undefined => "undefined".to_owned(),
			Self::Null => "null".to_owned(),
			Self::Bool(b) => b.to_string(),
			Self::Number(n) => number_to_string(*n),
			Self::String(s) => s.to_string(),
			Self::Array(items) => items
				.iter()
				.map(|item| if item.is_nullish() { String::new() } else { item.to_js_string() })
				.collect::<Vec<_>>()
				.join(","),
			Self::Object(_) => "[object Object]".to_owned(),
			Self::Node(_) => "[object Node]".to_owned(),
			Self::Callable(Callable::Method(name)) => format!("function {}() {{ [native code] }}", name),
			Self::Callable(Callable::Builtin(builtin)) => format!("function {:?}() {{ [native code] }}", builtin),
		}
	}

	/// `===`: value equality for primitives, identity for arrays and objects.
	/// `NaN` is never strictly equal to anything, including itself.
	#[must_use]
	pub fn strict_eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
			(Self::Bool(a), Self::Bool(b)) => a == b,
			#[allow(clippy::float_cmp)]
			(Self::Number(a), Self::Number(b)) => a == b,
			(Self::String(a), Self::String(b)) => a == b,
			(Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
			(Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
			(Self::Node(a), Self::Node(b)) => a == b,
			(Self::Callable(a), Self::Callable(b)) => a == b,
			_ => false,
		}
	}

	/// `==`, the abstract equality comparison.
	#[must_use]
	pub fn loose_eq(&self, other: &Self) -> bool {
		match (self, other) {
			(a, b) if core::mem::discriminant(a) == core::mem::discriminant(b) => a.strict_eq(b),
			(a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
			(Self::Bool(_), b) => Self::Number(self.to_number()).loose_eq(b),
			(a, Self::Bool(_)) => a.loose_eq(&Self::Number(other.to_number())),
			(Self::Number(a), Self::String(_)) => Self::Number(*a).strict_eq(&Self::Number(other.to_number())),
			(Self::String(_), Self::Number(b)) => Self::Number(self.to_number()).strict_eq(&Self::Number(*b)),
			(Self::Array(_) | Self::Object(_), b @ (Self::Number(_) | Self::String(_))) => Self::String(self.to_js_string().into()).loose_eq(b),
			(a @ (Self::Number(_) | Self::String(_)), Self::Array(_) | Self::Object(_)) => a.loose_eq(&Self::String(other.to_js_string().into())),
			_ => false,
		}
	}

	/// The string a value becomes when used as a property key.
	#[must_use]
	pub fn to_property_key(&self) -> String {
		self.to_js_string()
	}
}

impl Display for Value {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_js_string())
	}
}

/// ECMAScript `Number::toString(10)`.
#[must_use]
pub fn number_to_string(n: f64) -> String {
	if n.is_nan() {
		"NaN".to_owned()
	} else if n.is_infinite() {
		(if n > 0.0 { "Infinity" } else { "-Infinity" }).to_owned()
	} else if n == 0.0 {
		"0".to_owned()
	} else if n.abs() >= 1e21 || n.abs() < 1e-6 {
		let exponential = format!("{:e}", n);
		match exponential.split_once('e') {
			Some((mantissa, exponent)) if !exponent.starts_with('-') => format!("{}e+{}", mantissa, exponent),
			_ => exponential,
		}
	} else {
		n.to_string()
	}
}

/// ECMAScript `StringToNumber`: surrounding whitespace is ignored, the empty string is `0`,
/// anything that isn't a complete numeric literal is `NaN`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn string_to_number(s: &str) -> f64 {
	let s = s.trim();
	if s.is_empty() {
		return 0.0;
	}
	match s {
		"Infinity" | "+Infinity" => return f64::INFINITY,
		"-Infinity" => return f64::NEG_INFINITY,
		_ => (),
	}
	if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		return u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
	}
	if !s.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E')) {
		return f64::NAN;
	}
	s.parse().unwrap_or(f64::NAN)
}

impl From<f64> for Value {
	fn from(n: f64) -> Self {
		Self::Number(n)
	}
}

impl From<i32> for Value {
	fn from(n: i32) -> Self {
		Self::Number(n.into())
	}
}

impl From<u32> for Value {
	fn from(n: u32) -> Self {
		Self::Number(n.into())
	}
}

impl From<usize> for Value {
	#[allow(clippy::cast_precision_loss)]
	fn from(n: usize) -> Self {
		Self::Number(n as f64)
	}
}

impl From<bool> for Value {
	fn from(b: bool) -> Self {
		Self::Bool(b)
	}
}

impl From<&str> for Value {
	fn from(s: &str) -> Self {
		Self::String(s.into())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Self::String(s.into())
	}
}

impl From<Rc<str>> for Value {
	fn from(s: Rc<str>) -> Self {
		Self::String(s)
	}
}

impl From<Vec<Value>> for Value {
	fn from(items: Vec<Value>) -> Self {
		Self::Array(Rc::new(items))
	}
}

impl From<Object> for Value {
	fn from(object: Object) -> Self {
		Self::Object(Rc::new(object))
	}
}

impl From<NodeId> for Value {
	fn from(node: NodeId) -> Self {
		Self::Node(node)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map_or(Self::Null, Into::into)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numbers_print_like_javascript() {
		assert_eq!(number_to_string(1.0), "1");
		assert_eq!(number_to_string(-0.0), "0");
		assert_eq!(number_to_string(0.5), "0.5");
		assert_eq!(number_to_string(1.0 / 0.0), "Infinity");
		assert_eq!(number_to_string(f64::NAN), "NaN");
		assert_eq!(number_to_string(1e21), "1e+21");
		assert_eq!(number_to_string(1e-7), "1e-7");
		assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
	}

	#[test]
	fn strings_parse_like_javascript() {
		assert!((string_to_number(" 42 ") - 42.0).abs() < f64::EPSILON);
		assert!(string_to_number("").abs() < f64::EPSILON);
		assert!(string_to_number("inf").is_nan());
		assert!(string_to_number("4px").is_nan());
		assert!((string_to_number("0x10") - 16.0).abs() < f64::EPSILON);
	}

	#[test]
	fn identity_for_containers() {
		let a = Value::array(vec![Value::from(1)]);
		let b = Value::array(vec![Value::from(1)]);
		assert!(a.strict_eq(&a.clone()));
		assert!(!a.strict_eq(&b));
		assert_eq!(a, b);
		assert!(!Value::Number(f64::NAN).strict_eq(&Value::Number(f64::NAN)));
	}

	#[test]
	fn abstract_equality() {
		assert!(Value::Null.loose_eq(&Value::Undefined));
		assert!(Value::from(1).loose_eq(&Value::from("1")));
		assert!(Value::from(true).loose_eq(&Value::from("1")));
		assert!(!Value::Null.loose_eq(&Value::from(0)));
	}

	#[test]
	fn array_to_string() {
		let v = Value::array(vec![Value::from(1), Value::Null, Value::from("a")]);
		assert_eq!(v.to_js_string(), "1,,a");
	}

	#[test]
	fn objects_keep_insertion_order() {
		let mut object: Object = [("b", 1), ("a", 2), ("c", 3)].into_iter().collect();
		object.insert("a", 4);
		assert_eq!(object.keys().map(|k| &**k).collect::<Vec<_>>(), ["b", "a", "c"]);
		assert_eq!(object.get("a"), Some(&Value::from(4)));
		assert_eq!(object.remove("b"), Some(Value::from(1)));
		object.insert("b", 5);
		assert_eq!(object.keys().map(|k| &**k).collect::<Vec<_>>(), ["a", "c", "b"]);
		assert_eq!(object.len(), 3);
	}
}
