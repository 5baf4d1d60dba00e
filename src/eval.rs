//! Evaluation of parsed [`Program`]s against a [`Frame`] of named values.

use crate::{
	expr::{parse_expression, parse_program, AssignTarget, BinaryOperator, Expr, LogicalOperator, Program, TemplatePart, UnaryOperator},
	value::{number_to_string, string_to_number, Builtin, Callable, Object, Value},
	Error, Result,
};
use core::cmp::Ordering;
use hashbrown::{Equivalent, HashMap};
use num_traits::ToPrimitive;
use std::rc::Rc;
use tracing::trace;

/// What an expression can reach outside of its [`Frame`]: the methods and state of the component it belongs to.
pub trait Host {
	fn call_method(&mut self, name: &str, arguments: Vec<Value>) -> Result<Value>;

	/// Handles `$.field = value`.
	fn set_state(&mut self, field: &str, value: Value) -> Result<()>;
}

/// A [`Host`] without methods or state, e.g. for constant expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHost;
impl Host for NoHost {
	fn call_method(&mut self, name: &str, _: Vec<Value>) -> Result<Value> {
		Err(Error::UnknownMethod(name.to_owned()))
	}

	fn set_state(&mut self, field: &str, _: Value) -> Result<()> {
		Err(Error::Reference(format!("$.{}", field)))
	}
}

/// The ordered parameters an expression is evaluated with. Later bindings shadow earlier ones of the same name.
#[derive(Debug, Clone, Default)]
pub struct Frame {
	bindings: Vec<(Rc<str>, Value)>,
}

impl Frame {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<Rc<str>>, value: impl Into<Value>) {
		self.bindings.push((name.into(), value.into()));
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<&Value> {
		self.bindings.iter().rev().find(|(n, _)| &**n == name).map(|(_, v)| v)
	}

	/// Assigns to the visible binding of `name`. Returns `false` if there is none.
	pub fn set(&mut self, name: &str, value: Value) -> bool {
		match self.bindings.iter_mut().rev().find(|(n, _)| &**n == name) {
			Some((_, slot)) => {
				*slot = value;
				true
			}
			None => false,
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> + '_ {
		self.bindings.iter().map(|(n, v)| (n, v))
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.bindings.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.bindings.is_empty()
	}

	/// The parameter names, which together with the source text identify a compiled program.
	#[must_use]
	pub fn shape(&self) -> String {
		let mut shape = String::new();
		for (i, (name, _)) in self.bindings.iter().enumerate() {
			if i > 0 {
				shape.push(',');
			}
			shape.push_str(name);
		}
		shape
	}
}

/// Whether a directive body is a single expression (attributes, text, conditions) or a statement sequence (handlers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
	Expression,
	Statements,
}

#[derive(Hash)]
struct KeyRef<'a>(ProgramKind, &'a str, &'a str);
impl Equivalent<(ProgramKind, Box<str>, Box<str>)> for KeyRef<'_> {
	fn equivalent(&self, key: &(ProgramKind, Box<str>, Box<str>)) -> bool {
		self.0 == key.0 && self.1 == &*key.1 && self.2 == &*key.2
	}
}

/// Parsed programs by parameter shape and source text. Lives as long as the runtime.
#[derive(Debug, Default)]
pub struct ProgramCache {
	programs: HashMap<(ProgramKind, Box<str>, Box<str>), Rc<Program>>,
	parses: usize,
}

impl ProgramCache {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached program for `source` under `shape`, parsing it on first use.
	pub fn program(&mut self, kind: ProgramKind, shape: &str, source: &str) -> Result<Rc<Program>> {
		if let Some(program) = self.programs.get(&KeyRef(kind, shape, source)) {
			return Ok(program.clone());
		}
		trace!(?kind, "Parsing new program");
		self.parses += 1;
		let program = Rc::new(match kind {
			ProgramKind::Expression => Program {
				statements: vec![parse_expression(source)?],
			},
			ProgramKind::Statements => parse_program(source)?,
		});
		self.programs.insert((kind, shape.into(), source.into()), program.clone());
		Ok(program)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.programs.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.programs.is_empty()
	}

	/// How often a source text was actually parsed.
	#[must_use]
	pub fn parses(&self) -> usize {
		self.parses
	}
}

/// Runs `program`, returning the value of its last statement (`undefined` if it has none).
///
/// Assignments to plain names update `frame` in place, so callers can diff it afterwards.
pub fn evaluate(program: &Program, frame: &mut Frame, host: &mut dyn Host) -> Result<Value> {
	let mut evaluator = Evaluator { frame, host };
	let mut result = Value::Undefined;
	for statement in &program.statements {
		result = evaluator.eval(statement)?;
	}
	Ok(result)
}

struct Evaluator<'a> {
	frame: &'a mut Frame,
	host: &'a mut dyn Host,
}

impl Evaluator<'_> {
	fn eval(&mut self, expr: &Expr) -> Result<Value> {
		Ok(match expr {
			Expr::Literal(value) => value.clone(),
			Expr::Template(parts) => {
				let mut text = String::new();
				for part in parts {
					match part {
						TemplatePart::Text(t) => text.push_str(t),
						TemplatePart::Expr(expr) => text.push_str(&self.eval(expr)?.to_js_string()),
					}
				}
				Value::from(text)
			}
			Expr::Identifier(name) => self.resolve(name)?,
			Expr::Array(items) => Value::array(items.iter().map(|item| self.eval(item)).collect::<Result<Vec<_>>>()?),
			Expr::Object(entries) => {
				let mut object = Object::new();
				for (key, value) in entries {
					object.insert(key.clone(), self.eval(value)?);
				}
				Value::object(object)
			}
			Expr::Member { object, property, optional } => {
				let object = self.eval(object)?;
				if *optional && object.is_nullish() {
					return Ok(Value::Undefined);
				}
				get_property(&object, property)?
			}
			Expr::Index { object, index, optional } => {
				let object = self.eval(object)?;
				if *optional && object.is_nullish() {
					return Ok(Value::Undefined);
				}
				let key = self.eval(index)?.to_property_key();
				get_property(&object, &key)?
			}
			Expr::Call { callee, arguments } => self.call(callee, arguments)?,
			Expr::Unary(UnaryOperator::TypeOf, operand) => match &**operand {
				Expr::Identifier(name) if self.frame.get(name).is_none() && global(name).is_none() => Value::from("undefined"),
				operand => Value::from(self.eval(operand)?.type_of()),
			},
			Expr::Unary(operator, operand) => {
				let operand = self.eval(operand)?;
				match operator {
					UnaryOperator::Not => Value::Bool(!operand.is_truthy()),
					UnaryOperator::Negate => Value::Number(-operand.to_number()),
					UnaryOperator::Plus => Value::Number(operand.to_number()),
					UnaryOperator::TypeOf => Value::from(operand.type_of()),
				}
			}
			Expr::Binary(operator, left, right) => {
				let left = self.eval(left)?;
				let right = self.eval(right)?;
				binary(*operator, &left, &right)
			}
			Expr::Logical(operator, left, right) => {
				let left = self.eval(left)?;
				let short_circuit = match operator {
					LogicalOperator::And => !left.is_truthy(),
					LogicalOperator::Or => left.is_truthy(),
					LogicalOperator::Coalesce => !left.is_nullish(),
				};
				if short_circuit {
					left
				} else {
					self.eval(right)?
				}
			}
			Expr::Conditional { test, consequent, alternate } => {
				if self.eval(test)?.is_truthy() {
					self.eval(consequent)?
				} else {
					self.eval(alternate)?
				}
			}
			Expr::Assign { target, operator, value } => self.assign(target, *operator, value)?,
		})
	}

	fn resolve(&self, name: &str) -> Result<Value> {
		if let Some(value) = self.frame.get(name) {
			return Ok(value.clone());
		}
		global(name).ok_or_else(|| Error::Reference(name.to_owned()))
	}

	fn arguments(&mut self, arguments: &[Expr]) -> Result<Vec<Value>> {
		arguments.iter().map(|argument| self.eval(argument)).collect()
	}

	fn call(&mut self, callee: &Expr, arguments: &[Expr]) -> Result<Value> {
		let (object, name) = match callee {
			Expr::Member { object, property, optional } => {
				let object = self.eval(object)?;
				if *optional && object.is_nullish() {
					return Ok(Value::Undefined);
				}
				(object, property.to_string())
			}
			Expr::Index { object, index, optional } => {
				let object = self.eval(object)?;
				if *optional && object.is_nullish() {
					return Ok(Value::Undefined);
				}
				let name = self.eval(index)?.to_property_key();
				(object, name)
			}
			callee => {
				let function = self.eval(callee)?;
				let arguments = self.arguments(arguments)?;
				return self.call_value(&function, arguments);
			}
		};
		let arguments = self.arguments(arguments)?;
		if let Some(result) = intrinsic_method(&object, &name, &arguments) {
			return result;
		}
		let function = get_property(&object, &name)?;
		if function.is_callable() {
			self.call_value(&function, arguments)
		} else {
			Err(Error::Type(format!("{} is not a function", name)))
		}
	}

	fn call_value(&mut self, function: &Value, arguments: Vec<Value>) -> Result<Value> {
		match function {
			Value::Callable(Callable::Method(name)) => self.host.call_method(name, arguments),
			Value::Callable(Callable::Builtin(builtin)) => Ok(call_builtin(*builtin, &arguments)),
			other => Err(Error::Type(format!("{} is not a function", other.type_of()))),
		}
	}

	fn assign(&mut self, target: &AssignTarget, operator: Option<BinaryOperator>, value: &Expr) -> Result<Value> {
		let value = self.eval(value)?;
		match target {
			AssignTarget::Identifier(name) => {
				let value = match operator {
					Some(operator) => binary(operator, &self.resolve(name)?, &value),
					None => value,
				};
				if self.frame.set(name, value.clone()) {
					Ok(value)
				} else {
					Err(Error::Reference(name.to_string()))
				}
			}
			AssignTarget::StateField(field) => {
				let state = self.frame.get("$").and_then(Value::as_object).cloned();
				let value = match operator {
					Some(operator) => {
						let current = state.as_ref().and_then(|state| state.get(field)).cloned().unwrap_or_default();
						binary(operator, &current, &value)
					}
					None => value,
				};
				self.host.set_state(field, value.clone())?;
				if let Some(mut state) = state {
					state.insert(field.clone(), value.clone());
					self.frame.set("$", Value::object(state));
				}
				Ok(value)
			}
		}
	}
}

fn global(name: &str) -> Option<Value> {
	let builtin = |builtin| Value::Callable(Callable::Builtin(builtin));
	Some(match name {
		"String" => builtin(Builtin::String),
		"Number" => builtin(Builtin::Number),
		"Boolean" => builtin(Builtin::Boolean),
		"parseInt" => builtin(Builtin::ParseInt),
		"parseFloat" => builtin(Builtin::ParseFloat),
		"isNaN" => builtin(Builtin::IsNaN),
		"Math" => Value::object(
			[
				("floor", builtin(Builtin::MathFloor)),
				("ceil", builtin(Builtin::MathCeil)),
				("round", builtin(Builtin::MathRound)),
				("abs", builtin(Builtin::MathAbs)),
				("min", builtin(Builtin::MathMin)),
				("max", builtin(Builtin::MathMax)),
				("PI", Value::Number(core::f64::consts::PI)),
			]
			.into_iter()
			.collect(),
		),
		_ => return None,
	})
}

fn to_primitive(value: &Value) -> Value {
	match value {
		Value::Array(_) | Value::Object(_) | Value::Node(_) | Value::Callable(_) => Value::from(value.to_js_string()),
		primitive => primitive.clone(),
	}
}

#[must_use]
pub fn binary(operator: BinaryOperator, left: &Value, right: &Value) -> Value {
	use BinaryOperator as B;
	match operator {
		B::Add => {
			let (left, right) = (to_primitive(left), to_primitive(right));
			if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
				Value::from(left.to_js_string() + &right.to_js_string())
			} else {
				Value::Number(left.to_number() + right.to_number())
			}
		}
		B::Subtract => Value::Number(left.to_number() - right.to_number()),
		B::Multiply => Value::Number(left.to_number() * right.to_number()),
		B::Divide => Value::Number(left.to_number() / right.to_number()),
		B::Remainder => Value::Number(left.to_number() % right.to_number()),
		B::Equal => Value::Bool(left.loose_eq(right)),
		B::NotEqual => Value::Bool(!left.loose_eq(right)),
		B::StrictEqual => Value::Bool(left.strict_eq(right)),
		B::StrictNotEqual => Value::Bool(!left.strict_eq(right)),
		B::Less | B::LessEqual | B::Greater | B::GreaterEqual => {
			let ordering = match (to_primitive(left), to_primitive(right)) {
				(Value::String(a), Value::String(b)) => Some(a.cmp(&b)),
				(a, b) => a.to_number().partial_cmp(&b.to_number()),
			};
			Value::Bool(matches!(
				(operator, ordering),
				(B::Less, Some(Ordering::Less))
					| (B::LessEqual, Some(Ordering::Less | Ordering::Equal))
					| (B::Greater, Some(Ordering::Greater))
					| (B::GreaterEqual, Some(Ordering::Greater | Ordering::Equal))
			))
		}
	}
}

fn get_property(object: &Value, key: &str) -> Result<Value> {
	Ok(match object {
		Value::Undefined | Value::Null => {
			return Err(Error::Type(format!("Cannot read properties of {} (reading '{}')", object.to_js_string(), key)));
		}
		Value::String(s) => match key {
			"length" => Value::from(s.chars().count()),
			_ => key.parse::<usize>().ok().and_then(|i| s.chars().nth(i)).map_or(Value::Undefined, |c| Value::from(c.to_string())),
		},
		Value::Array(items) => match key {
			"length" => Value::from(items.len()),
			_ => key.parse::<usize>().ok().and_then(|i| items.get(i)).cloned().unwrap_or_default(),
		},
		Value::Object(object) => object.get(key).cloned().unwrap_or_default(),
		_ => Value::Undefined,
	})
}

/// Resolves a relative index like `slice` does: negative values count from the end, and the result is clamped.
fn relative_index(value: Option<&Value>, len: usize, default: usize) -> usize {
	match value {
		None | Some(Value::Undefined) => default,
		Some(value) => {
			let n = value.to_number();
			let n = if n.is_nan() { 0.0 } else { n.trunc() };
			let n = if n < 0.0 { (n + len.to_f64().unwrap_or(f64::MAX)).max(0.0) } else { n };
			n.to_usize().unwrap_or(len).min(len)
		}
	}
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
		(a, b) => a.strict_eq(b),
	}
}

fn index_to_value(index: Option<usize>) -> Value {
	index.map_or(Value::Number(-1.0), Value::from)
}

/// Built-in methods of primitive values and arrays. `None` means "not an intrinsic", so the property is looked up.
#[allow(clippy::too_many_lines)]
fn intrinsic_method(object: &Value, name: &str, arguments: &[Value]) -> Option<Result<Value>> {
	let argument = |i: usize| arguments.get(i).cloned().unwrap_or_default();
	let string_argument = |i: usize| argument(i).to_js_string();
	Some(Ok(match (object, name) {
		(Value::String(s), "toUpperCase") => Value::from(s.to_uppercase()),
		(Value::String(s), "toLowerCase") => Value::from(s.to_lowercase()),
		(Value::String(s), "trim") => Value::from(s.trim()),
		(Value::String(s), "trimStart") => Value::from(s.trim_start()),
		(Value::String(s), "trimEnd") => Value::from(s.trim_end()),
		(Value::String(s), "includes") => Value::Bool(s.contains(string_argument(0).as_str())),
		(Value::String(s), "startsWith") => Value::Bool(s.starts_with(string_argument(0).as_str())),
		(Value::String(s), "endsWith") => Value::Bool(s.ends_with(string_argument(0).as_str())),
		(Value::String(s), "indexOf") => index_to_value(s.find(string_argument(0).as_str()).map(|byte| s[..byte].chars().count())),
		(Value::String(s), "slice") => {
			let chars: Vec<char> = s.chars().collect();
			let start = relative_index(arguments.first(), chars.len(), 0);
			let end = relative_index(arguments.get(1), chars.len(), chars.len());
			Value::from(chars.get(start..end.max(start)).map_or_else(String::new, |chars| chars.iter().collect()))
		}
		(Value::String(s), "split") => match arguments.first() {
			None | Some(Value::Undefined) => Value::array(vec![object.clone()]),
			Some(separator) => {
				let separator = separator.to_js_string();
				if separator.is_empty() {
					Value::array(s.chars().map(|c| Value::from(c.to_string())))
				} else {
					Value::array(s.split(separator.as_str()).map(Value::from))
				}
			}
		},
		(Value::String(s), "replace") => Value::from(s.replacen(string_argument(0).as_str(), &string_argument(1), 1)),
		(Value::String(s), "replaceAll") => Value::from(s.replace(string_argument(0).as_str(), &string_argument(1))),
		(Value::String(_) | Value::Bool(_), "toString") => Value::from(object.to_js_string()),
		(Value::Number(n), "toString") => Value::from(number_to_string(*n)),
		(Value::Number(n), "toFixed") => {
			let digits = argument(0).to_number().to_usize().unwrap_or(0).min(100);
			Value::from(format!("{:.*}", digits, n))
		}
		(Value::Array(items), "join") => {
			let separator = match arguments.first() {
				None | Some(Value::Undefined) => ",".to_owned(),
				Some(separator) => separator.to_js_string(),
			};
			Value::from(
				items
					.iter()
					.map(|item| if item.is_nullish() { String::new() } else { item.to_js_string() })
					.collect::<Vec<_>>()
					.join(&separator),
			)
		}
		(Value::Array(items), "includes") => Value::Bool(items.iter().any(|item| same_value_zero(item, &argument(0)))),
		(Value::Array(items), "indexOf") => index_to_value(items.iter().position(|item| item.strict_eq(&argument(0)))),
		(Value::Array(items), "slice") => {
			let start = relative_index(arguments.first(), items.len(), 0);
			let end = relative_index(arguments.get(1), items.len(), items.len());
			Value::array(items.get(start..end.max(start)).map_or_else(Vec::new, <[Value]>::to_vec))
		}
		(Value::Array(items), "concat") => {
			let mut joined = items.to_vec();
			for argument in arguments {
				match argument {
					Value::Array(more) => joined.extend(more.iter().cloned()),
					other => joined.push(other.clone()),
				}
			}
			Value::array(joined)
		}
		(Value::Array(_), "toString") => Value::from(object.to_js_string()),
		(Value::Undefined | Value::Null, _) => {
			return Some(Err(Error::Type(format!("Cannot read properties of {} (reading '{}')", object.to_js_string(), name))));
		}
		_ => return None,
	}))
}

fn parse_int(text: &str, radix: Option<u32>) -> f64 {
	let text = text.trim_start();
	let (negative, text) = match text.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, text.strip_prefix('+').unwrap_or(text)),
	};
	let (radix, text) = match radix {
		Some(16) | None if text.starts_with("0x") || text.starts_with("0X") => (16, &text[2..]),
		Some(radix) if (2..=36).contains(&radix) => (radix, text),
		Some(_) => return f64::NAN,
		None => (10, text),
	};
	let digits = text.find(|c: char| !c.is_digit(radix)).unwrap_or(text.len());
	if digits == 0 {
		return f64::NAN;
	}
	let mut n = 0.0;
	for c in text[..digits].chars() {
		n = n * f64::from(radix) + f64::from(c.to_digit(radix).unwrap_or(0));
	}
	if negative {
		-n
	} else {
		n
	}
}

fn parse_float(text: &str) -> f64 {
	let text = text.trim_start();
	let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
	if unsigned.starts_with("Infinity") {
		return if text.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
	}
	let bytes = text.as_bytes();
	let mut end = usize::from(bytes.first().map_or(false, |b| matches!(b, b'+' | b'-')));
	let mut seen_dot = false;
	let mut seen_digit = false;
	while end < bytes.len() {
		match bytes[end] {
			b'0'..=b'9' => seen_digit = true,
			b'.' if !seen_dot => seen_dot = true,
			_ => break,
		}
		end += 1;
	}
	if !seen_digit {
		return f64::NAN;
	}
	if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
		let mut exponent = end + 1;
		if exponent < bytes.len() && matches!(bytes[exponent], b'+' | b'-') {
			exponent += 1;
		}
		if exponent < bytes.len() && bytes[exponent].is_ascii_digit() {
			end = exponent;
			while end < bytes.len() && bytes[end].is_ascii_digit() {
				end += 1;
			}
		}
	}
	string_to_number(&text[..end])
}

fn call_builtin(builtin: Builtin, arguments: &[Value]) -> Value {
	let number = |i: usize| arguments.get(i).map_or(f64::NAN, Value::to_number);
	match builtin {
		Builtin::String => Value::from(arguments.first().map_or_else(String::new, Value::to_js_string)),
		Builtin::Number => Value::Number(arguments.first().map_or(0.0, Value::to_number)),
		Builtin::Boolean => Value::Bool(arguments.first().map_or(false, Value::is_truthy)),
		Builtin::ParseInt => {
			let radix = arguments.get(1).map(Value::to_number).filter(|r| *r != 0.0 && !r.is_nan()).and_then(|r| r.to_u32());
			Value::Number(parse_int(&arguments.first().map_or_else(String::new, Value::to_js_string), radix))
		}
		Builtin::ParseFloat => Value::Number(parse_float(&arguments.first().map_or_else(String::new, Value::to_js_string))),
		Builtin::IsNaN => Value::Bool(number(0).is_nan()),
		Builtin::MathFloor => Value::Number(number(0).floor()),
		Builtin::MathCeil => Value::Number(number(0).ceil()),
		Builtin::MathRound => Value::Number((number(0) + 0.5).floor()),
		Builtin::MathAbs => Value::Number(number(0).abs()),
		Builtin::MathMin => Value::Number(arguments.iter().map(Value::to_number).fold(f64::INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) })),
		Builtin::MathMax => Value::Number(arguments.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) })),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn eval_in(source: &str, frame: &mut Frame) -> Result<Value> {
		let program = parse_program(source)?;
		evaluate(&program, frame, &mut NoHost)
	}

	fn eval(source: &str) -> Value {
		eval_in(source, &mut Frame::new()).unwrap()
	}

	#[test]
	fn arithmetic_follows_javascript() {
		assert_eq!(eval("1/0").to_js_string(), "Infinity");
		assert_eq!(eval("'a' + 1 + 2").to_js_string(), "a12");
		assert_eq!(eval("1 + 2 + 'a'").to_js_string(), "3a");
		assert_eq!(eval("'3' * '4'"), Value::Number(12.0));
		assert_eq!(eval("-7 % 3"), Value::Number(-1.0));
		assert!(eval("0/0").to_number().is_nan());
	}

	#[test]
	fn logic_and_comparisons() {
		assert_eq!(eval("null ?? 'x'"), Value::from("x"));
		assert_eq!(eval("0 || 'y'"), Value::from("y"));
		assert_eq!(eval("'' && 1"), Value::from(""));
		assert_eq!(eval("'b' > 'a'"), Value::Bool(true));
		assert_eq!(eval("'10' < 9"), Value::Bool(false));
		assert_eq!(eval("1 == '1' && 1 !== '1'"), Value::Bool(true));
		assert_eq!(eval("[] === []"), Value::Bool(false));
		assert_eq!(eval("typeof nope"), Value::from("undefined"));
	}

	#[test]
	fn frames_shadow_and_assign() {
		let mut frame = Frame::new();
		frame.push("x", 1);
		frame.push("x", 2);
		assert_eq!(eval_in("x", &mut frame).unwrap(), Value::from(2));
		assert_eq!(eval_in("x += 3; x * 2", &mut frame).unwrap(), Value::from(10));
		assert_eq!(frame.get("x"), Some(&Value::from(5)));
		assert_eq!(eval_in("missing = 1", &mut frame), Err(Error::Reference("missing".to_owned())));
		assert_eq!(frame.shape(), "x,x");
	}

	#[test]
	fn members_and_methods() {
		let mut frame = Frame::new();
		frame.push("items", Value::array(vec![Value::from("a"), Value::from("b")]));
		frame.push("user", Value::object([("name", "Ann")].into_iter().collect()));
		assert_eq!(eval_in("items.length + ':' + items[1]", &mut frame).unwrap(), Value::from("2:b"));
		assert_eq!(eval_in("user.name.toUpperCase()", &mut frame).unwrap(), Value::from("ANN"));
		assert_eq!(eval_in("user?.missing?.deeper", &mut frame).unwrap(), Value::Undefined);
		assert_eq!(eval_in("items.join('-')", &mut frame).unwrap(), Value::from("a-b"));
		assert_eq!(eval_in("`${user.name} has ${items.length}`", &mut frame).unwrap(), Value::from("Ann has 2"));
		assert!(matches!(eval_in("user.missing.deeper", &mut frame), Err(Error::Type(_))));
	}

	#[test]
	fn builtins() {
		assert_eq!(eval("String(12) + Number('3')"), Value::from("123"));
		assert_eq!(eval("parseInt('42px')"), Value::Number(42.0));
		assert_eq!(eval("parseFloat('2.5e1x')"), Value::Number(25.0));
		assert_eq!(eval("Math.max(1, 5, 3)"), Value::Number(5.0));
		assert_eq!(eval("Math.round(2.5)"), Value::Number(3.0));
		assert_eq!(eval("(1.005).toFixed(1)"), Value::from("1.0"));
	}

	struct Recorder(Vec<(String, Value)>);
	impl Host for Recorder {
		fn call_method(&mut self, name: &str, arguments: Vec<Value>) -> Result<Value> {
			Ok(Value::from(format!("{}({})", name, Value::array(arguments))))
		}

		fn set_state(&mut self, field: &str, value: Value) -> Result<()> {
			self.0.push((field.to_owned(), value));
			Ok(())
		}
	}

	#[test]
	fn methods_and_state_writes_go_to_the_host() {
		let mut frame = Frame::new();
		frame.push("greet", Value::Callable(Callable::Method("greet".into())));
		frame.push("count", 1);
		frame.push("$", Value::object([("count", 1)].into_iter().collect()));
		let mut host = Recorder(Vec::new());
		let program = parse_program("$.count += 1; greet($.count, 'x')").unwrap();
		let result = evaluate(&program, &mut frame, &mut host).unwrap();
		assert_eq!(result, Value::from("greet(2,x)"));
		assert_eq!(host.0, vec![("count".to_owned(), Value::from(2))]);
	}

	#[test]
	fn programs_are_cached_by_shape_and_source() {
		let mut cache = ProgramCache::new();
		let a = cache.program(ProgramKind::Expression, "x,y", "x + y").unwrap();
		let b = cache.program(ProgramKind::Expression, "x,y", "x + y").unwrap();
		assert!(Rc::ptr_eq(&a, &b));
		cache.program(ProgramKind::Expression, "x", "x + y").unwrap();
		cache.program(ProgramKind::Statements, "x,y", "x + y").unwrap();
		assert_eq!(cache.parses(), 3);
		assert!(cache.program(ProgramKind::Expression, "", "a b").is_err());
	}
}
