use crate::{
	value::{Object, Value},
	Error, Result,
};
use std::rc::Rc;

/// Field storage with change detection, backing a component's `$` and `$css`.
///
/// Writing doesn't schedule anything by itself: [`Observable::set`] reports whether the value changed
/// and the runtime decides what to re-render.
#[derive(Debug, Clone, Default)]
pub struct Observable {
	fields: Object,
}

impl Observable {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn get(&self, field: &str) -> Option<&Value> {
		self.fields.get(field)
	}

	#[must_use]
	pub fn contains(&self, field: &str) -> bool {
		self.fields.get(field).is_some()
	}

	/// Stores `value`, returning whether it differs (by `!==`) from what was there.
	///
	/// # Errors
	///
	/// Names starting with `$` are reserved for the engine.
	pub fn set(&mut self, field: &str, value: Value) -> Result<bool> {
		if field.starts_with('$') {
			return Err(Error::ReservedField { field: field.to_owned() });
		}
		let changed = self.fields.get(field).map_or(true, |old| !old.strict_eq(&value));
		self.fields.insert(Rc::<str>::from(field), value);
		Ok(changed)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> + '_ {
		self.fields.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.fields.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	/// A snapshot of all fields, as exposed to expressions under `$`.
	#[must_use]
	pub fn to_value(&self) -> Value {
		Value::object(self.fields.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identity_change_detection() {
		let mut state = Observable::new();
		assert_eq!(state.set("a", Value::from(1)), Ok(true));
		assert_eq!(state.set("a", Value::from(1)), Ok(false));

		let list = Value::array(vec![Value::from(1)]);
		assert_eq!(state.set("list", list.clone()), Ok(true));
		assert_eq!(state.set("list", list), Ok(false));
		assert_eq!(state.set("list", Value::array(vec![Value::from(1)])), Ok(true));

		assert_eq!(state.set("nan", Value::Number(f64::NAN)), Ok(true));
		assert_eq!(state.set("nan", Value::Number(f64::NAN)), Ok(true));
	}

	#[test]
	fn reserved_prefix() {
		let mut state = Observable::new();
		assert_eq!(state.set("$x", Value::Null), Err(Error::ReservedField { field: "$x".to_owned() }));
		assert!(state.is_empty());
	}

	#[test]
	fn undefined_is_a_value() {
		let mut state = Observable::new();
		assert_eq!(state.set("u", Value::Undefined), Ok(true));
		assert_eq!(state.set("u", Value::Undefined), Ok(false));
		assert!(state.contains("u"));
	}
}
