use crate::{Error, Result};
use tracing::trace;

/// The single global style sheet all components share.
///
/// Rules are addressed by position, like `CSSStyleSheet.cssRules`.
/// The runtime only ever appends or replaces in place, so an index it handed out stays valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stylesheet {
	rules: Vec<String>,
}

impl Stylesheet {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts `rule` at `index`, shifting later rules back.
	///
	/// # Errors
	///
	/// Iff `index` is greater than [`Stylesheet::len`].
	pub fn insert_rule(&mut self, rule: impl Into<String>, index: usize) -> Result<usize> {
		if index > self.rules.len() {
			return Err(Error::RuleIndex { index, len: self.rules.len() });
		}
		self.rules.insert(index, rule.into());
		trace!(index, "Inserted rule");
		Ok(index)
	}

	/// Appends `rule` and returns its index.
	pub fn push_rule(&mut self, rule: impl Into<String>) -> usize {
		self.rules.push(rule.into());
		self.rules.len() - 1
	}

	pub fn delete_rule(&mut self, index: usize) -> Result<String> {
		if index >= self.rules.len() {
			return Err(Error::RuleIndex { index, len: self.rules.len() });
		}
		Ok(self.rules.remove(index))
	}

	/// Deletes the rule at `index` and inserts `rule` in its place.
	pub fn replace_rule(&mut self, index: usize, rule: impl Into<String>) -> Result<()> {
		self.delete_rule(index)?;
		self.insert_rule(rule, index).map(drop)
	}

	#[must_use]
	pub fn rule(&self, index: usize) -> Option<&str> {
		self.rules.get(index).map(String::as_str)
	}

	#[must_use]
	pub fn rules(&self) -> &[String] {
		&self.rules
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.rules.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	/// All rules, one per line.
	#[must_use]
	pub fn css_text(&self) -> String {
		self.rules.join("\n")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn positional() {
		let mut sheet = Stylesheet::new();
		assert_eq!(sheet.push_rule("a {}"), 0);
		assert_eq!(sheet.push_rule("b {}"), 1);
		sheet.replace_rule(0, "c {}").unwrap();
		assert_eq!(sheet.rules(), ["c {}", "b {}"]);
		assert_eq!(sheet.insert_rule("d {}", 3), Err(Error::RuleIndex { index: 3, len: 2 }));
		assert_eq!(sheet.delete_rule(1).as_deref(), Ok("b {}"));
		assert_eq!(sheet.css_text(), "c {}");
	}
}
