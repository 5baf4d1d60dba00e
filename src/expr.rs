//! Lexer and Pratt parser for the template expression language.
//!
//! The grammar is the expression subset of ECMAScript that directives are written in,
//! plus `;`-separated statement sequences and assignments for event handlers.

use crate::{value::Value, Error, Result};
use std::rc::Rc;

/// A parsed directive body: zero or more statements. Its value is the value of the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
	pub statements: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
	Literal(Value),
	Template(Vec<TemplatePart>),
	Identifier(Rc<str>),
	Array(Vec<Expr>),
	Object(Vec<(Rc<str>, Expr)>),
	Member {
		object: Box<Expr>,
		property: Rc<str>,
		optional: bool,
	},
	Index {
		object: Box<Expr>,
		index: Box<Expr>,
		optional: bool,
	},
	Call {
		callee: Box<Expr>,
		arguments: Vec<Expr>,
	},
	Unary(UnaryOperator, Box<Expr>),
	Binary(BinaryOperator, Box<Expr>, Box<Expr>),
	Logical(LogicalOperator, Box<Expr>, Box<Expr>),
	Conditional {
		test: Box<Expr>,
		consequent: Box<Expr>,
		alternate: Box<Expr>,
	},
	Assign {
		target: AssignTarget,
		operator: Option<BinaryOperator>,
		value: Box<Expr>,
	},
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
	Text(Rc<str>),
	Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
	/// A name in the evaluation frame.
	Identifier(Rc<str>),
	/// `$.<field>`, written through to the component's state.
	StateField(Rc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
	Not,
	Negate,
	Plus,
	TypeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
	Add,
	Subtract,
	Multiply,
	Divide,
	Remainder,
	Less,
	LessEqual,
	Greater,
	GreaterEqual,
	Equal,
	NotEqual,
	StrictEqual,
	StrictNotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
	And,
	Or,
	Coalesce,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
	Number(f64),
	String(String),
	Template(Vec<Chunk>),
	Identifier(String),
	Punct(&'static str),
	End,
}

#[derive(Debug, Clone, PartialEq)]
enum Chunk {
	Text(String),
	Source(String),
}

/// Longest first, so that the lexer can take the first match.
const PUNCTUATORS: &[&str] = &[
	"===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "+=", "-=", "*=", "/=", "(", ")", "[", "]", "{", "}", ",", ";", ":", "?",
	".", "!", "=", "+", "-", "*", "/", "%", "<", ">",
];

struct Lexer<'a> {
	source: &'a str,
	position: usize,
}

impl<'a> Lexer<'a> {
	fn error(&self, offset: usize, message: impl Into<String>) -> Error {
		Error::Parse {
			expression: self.source.to_owned(),
			offset,
			message: message.into(),
		}
	}

	fn peek_char(&self) -> Option<char> {
		self.source[self.position..].chars().next()
	}

	fn tokenize(mut self) -> Result<Vec<(Token, usize)>> {
		let source = self.source;
		let mut tokens = Vec::new();
		loop {
			while self.peek_char().map_or(false, char::is_whitespace) {
				self.position += self.peek_char().map_or(0, char::len_utf8);
			}
			let start = self.position;
			let Some(c) = self.peek_char() else {
				tokens.push((Token::End, start));
				return Ok(tokens);
			};
			let rest = &source[start..];
			let token = if c.is_ascii_digit() || (c == '.' && rest[1..].starts_with(|c: char| c.is_ascii_digit())) {
				self.number()?
			} else if c == '"' || c == '\'' {
				Token::String(self.string(c)?)
			} else if c == '`' {
				Token::Template(self.template()?)
			} else if c == '$' || c == '_' || c.is_alphabetic() {
				let length = rest.find(|c: char| !(c == '$' || c == '_' || c.is_alphanumeric())).unwrap_or(rest.len());
				self.position += length;
				Token::Identifier(rest[..length].to_owned())
			} else if let Some(punct) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
				// `a?.5:b` is a conditional, not an optional chain.
				if *punct == "?." && rest[2..].starts_with(|c: char| c.is_ascii_digit()) {
					self.position += 1;
					Token::Punct("?")
				} else {
					self.position += punct.len();
					Token::Punct(punct)
				}
			} else {
				return Err(self.error(start, format!("unexpected character `{}`", c)));
			};
			tokens.push((token, start));
		}
	}

	#[allow(clippy::cast_precision_loss)]
	fn number(&mut self) -> Result<Token> {
		let source = self.source;
		let start = self.position;
		let rest = &source[start..];
		if rest.starts_with("0x") || rest.starts_with("0X") {
			let digits = rest[2..].find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(rest.len() - 2);
			self.position += 2 + digits;
			return u64::from_str_radix(&rest[2..2 + digits], 16)
				.map(|n| Token::Number(n as f64))
				.map_err(|_| self.error(start, "invalid hexadecimal literal"));
		}
		let bytes = rest.as_bytes();
		let mut length = 0;
		while length < bytes.len() && (bytes[length].is_ascii_digit() || bytes[length] == b'.') {
			length += 1;
		}
		if length < bytes.len() && matches!(bytes[length], b'e' | b'E') {
			let mut exponent = length + 1;
			if exponent < bytes.len() && matches!(bytes[exponent], b'+' | b'-') {
				exponent += 1;
			}
			if exponent < bytes.len() && bytes[exponent].is_ascii_digit() {
				length = exponent;
				while length < bytes.len() && bytes[length].is_ascii_digit() {
					length += 1;
				}
			}
		}
		self.position += length;
		rest[..length].parse().map(Token::Number).map_err(|_| self.error(start, "invalid number literal"))
	}

	fn escape(&mut self) -> Result<char> {
		let start = self.position;
		let c = self.peek_char().ok_or_else(|| self.error(start, "unterminated escape sequence"))?;
		self.position += c.len_utf8();
		Ok(match c {
			'n' => '\n',
			't' => '\t',
			'r' => '\r',
			'0' => '\0',
			'b' => '\u{8}',
			'f' => '\u{c}',
			'v' => '\u{b}',
			'u' => {
				let hex = self.source.get(self.position..self.position + 4).ok_or_else(|| self.error(start, "invalid unicode escape"))?;
				let code = u32::from_str_radix(hex, 16).map_err(|_| self.error(start, "invalid unicode escape"))?;
				self.position += 4;
				char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
			}
			other => other,
		})
	}

	fn string(&mut self, quote: char) -> Result<String> {
		let start = self.position;
		self.position += 1;
		let mut text = String::new();
		loop {
			let c = self.peek_char().ok_or_else(|| self.error(start, "unterminated string literal"))?;
			self.position += c.len_utf8();
			match c {
				c if c == quote => return Ok(text),
				'\\' => text.push(self.escape()?),
				c => text.push(c),
			}
		}
	}

	fn template(&mut self) -> Result<Vec<Chunk>> {
		let start = self.position;
		self.position += 1;
		let mut chunks = Vec::new();
		let mut text = String::new();
		loop {
			let c = self.peek_char().ok_or_else(|| self.error(start, "unterminated template literal"))?;
			self.position += c.len_utf8();
			match c {
				'`' => {
					if !text.is_empty() {
						chunks.push(Chunk::Text(text));
					}
					return Ok(chunks);
				}
				'\\' => text.push(self.escape()?),
				'$' if self.peek_char() == Some('{') => {
					self.position += 1;
					if !text.is_empty() {
						chunks.push(Chunk::Text(core::mem::take(&mut text)));
					}
					let source_start = self.position;
					let mut depth = 0_usize;
					let mut quote = None;
					loop {
						let c = self.peek_char().ok_or_else(|| self.error(start, "unterminated template substitution"))?;
						self.position += c.len_utf8();
						match (c, quote) {
							('\\', Some(_)) => self.position += self.peek_char().map_or(0, char::len_utf8),
							(c, Some(q)) if c == q => quote = None,
							(_, Some(_)) => (),
							('"' | '\'' | '`', None) => quote = Some(c),
							('{', None) => depth += 1,
							('}', None) if depth == 0 => break,
							('}', None) => depth -= 1,
							_ => (),
						}
					}
					chunks.push(Chunk::Source(self.source[source_start..self.position - 1].to_owned()));
				}
				c => text.push(c),
			}
		}
	}
}

static END: Token = Token::End;

struct Parser<'a> {
	source: &'a str,
	tokens: Vec<(Token, usize)>,
	position: usize,
}

impl Parser<'_> {
	fn peek(&self) -> &Token {
		self.tokens.get(self.position).map_or(&END, |(token, _)| token)
	}

	fn offset(&self) -> usize {
		self.tokens.get(self.position).map_or(self.source.len(), |(_, offset)| *offset)
	}

	fn next(&mut self) -> Token {
		let token = self.peek().clone();
		self.position += 1;
		token
	}

	fn error(&self, message: impl Into<String>) -> Error {
		Error::Parse {
			expression: self.source.to_owned(),
			offset: self.offset(),
			message: message.into(),
		}
	}

	fn is_punct(&self, punct: &str) -> bool {
		matches!(self.peek(), Token::Punct(p) if *p == punct)
	}

	fn eat(&mut self, punct: &str) -> bool {
		let found = self.is_punct(punct);
		if found {
			self.position += 1;
		}
		found
	}

	fn expect(&mut self, punct: &str) -> Result<()> {
		if self.eat(punct) {
			Ok(())
		} else {
			Err(self.error(format!("expected `{}`", punct)))
		}
	}

	fn program(&mut self) -> Result<Program> {
		let mut statements = Vec::new();
		loop {
			while self.eat(";") {}
			if *self.peek() == Token::End {
				return Ok(Program { statements });
			}
			statements.push(self.expression()?);
			if !self.eat(";") && *self.peek() != Token::End {
				return Err(self.error("expected `;` or the end of the expression"));
			}
		}
	}

	fn expression(&mut self) -> Result<Expr> {
		let target = self.conditional()?;
		let operator = match self.peek() {
			Token::Punct("=") => None,
			Token::Punct("+=") => Some(BinaryOperator::Add),
			Token::Punct("-=") => Some(BinaryOperator::Subtract),
			Token::Punct("*=") => Some(BinaryOperator::Multiply),
			Token::Punct("/=") => Some(BinaryOperator::Divide),
			_ => return Ok(target),
		};
		let target = match target {
			Expr::Identifier(name) => AssignTarget::Identifier(name),
			Expr::Member { object, property, optional: false } if *object == Expr::Identifier("$".into()) => AssignTarget::StateField(property),
			Expr::Index { object, index, optional: false } if *object == Expr::Identifier("$".into()) => match *index {
				Expr::Literal(Value::String(field)) => AssignTarget::StateField(field),
				_ => return Err(self.error("computed state fields can't be assigned")),
			},
			_ => return Err(self.error("invalid assignment target")),
		};
		self.position += 1;
		let value = self.expression()?;
		Ok(Expr::Assign {
			target,
			operator,
			value: Box::new(value),
		})
	}

	fn conditional(&mut self) -> Result<Expr> {
		let test = self.binary(0)?;
		if !self.eat("?") {
			return Ok(test);
		}
		let consequent = self.expression()?;
		self.expect(":")?;
		let alternate = self.expression()?;
		Ok(Expr::Conditional {
			test: Box::new(test),
			consequent: Box::new(consequent),
			alternate: Box::new(alternate),
		})
	}

	fn binary_operator(&self) -> Option<(u8, Result<BinaryOperator, LogicalOperator>)> {
		use BinaryOperator as B;
		let Token::Punct(punct) = self.peek() else {
			return None;
		};
		Some(match *punct {
			"??" => (1, Err(LogicalOperator::Coalesce)),
			"||" => (2, Err(LogicalOperator::Or)),
			"&&" => (3, Err(LogicalOperator::And)),
			"==" => (4, Ok(B::Equal)),
			"!=" => (4, Ok(B::NotEqual)),
			"===" => (4, Ok(B::StrictEqual)),
			"!==" => (4, Ok(B::StrictNotEqual)),
			"<" => (5, Ok(B::Less)),
			"<=" => (5, Ok(B::LessEqual)),
			">" => (5, Ok(B::Greater)),
			">=" => (5, Ok(B::GreaterEqual)),
			"+" => (6, Ok(B::Add)),
			"-" => (6, Ok(B::Subtract)),
			"*" => (7, Ok(B::Multiply)),
			"/" => (7, Ok(B::Divide)),
			"%" => (7, Ok(B::Remainder)),
			_ => return None,
		})
	}

	fn binary(&mut self, min_precedence: u8) -> Result<Expr> {
		let mut left = self.unary()?;
		while let Some((precedence, operator)) = self.binary_operator() {
			if precedence < min_precedence {
				break;
			}
			self.position += 1;
			let right = self.binary(precedence + 1)?;
			left = match operator {
				Ok(operator) => Expr::Binary(operator, Box::new(left), Box::new(right)),
				Err(operator) => Expr::Logical(operator, Box::new(left), Box::new(right)),
			};
		}
		Ok(left)
	}

	fn unary(&mut self) -> Result<Expr> {
		let operator = match self.peek() {
			Token::Punct("!") => UnaryOperator::Not,
			Token::Punct("-") => UnaryOperator::Negate,
			Token::Punct("+") => UnaryOperator::Plus,
			Token::Identifier(name) if name == "typeof" => UnaryOperator::TypeOf,
			_ => return self.postfix(),
		};
		self.position += 1;
		Ok(Expr::Unary(operator, Box::new(self.unary()?)))
	}

	fn property_name(&mut self) -> Result<Rc<str>> {
		match self.next() {
			Token::Identifier(name) => Ok(name.into()),
			_ => {
				self.position -= 1;
				Err(self.error("expected a property name"))
			}
		}
	}

	fn arguments(&mut self) -> Result<Vec<Expr>> {
		let mut arguments = Vec::new();
		while !self.eat(")") {
			arguments.push(self.expression()?);
			if !self.eat(",") {
				self.expect(")")?;
				break;
			}
		}
		Ok(arguments)
	}

	fn postfix(&mut self) -> Result<Expr> {
		let mut expr = self.primary()?;
		loop {
			expr = if self.eat(".") {
				Expr::Member {
					object: Box::new(expr),
					property: self.property_name()?,
					optional: false,
				}
			} else if self.eat("?.") {
				if self.eat("[") {
					let index = self.expression()?;
					self.expect("]")?;
					Expr::Index {
						object: Box::new(expr),
						index: Box::new(index),
						optional: true,
					}
				} else {
					Expr::Member {
						object: Box::new(expr),
						property: self.property_name()?,
						optional: true,
					}
				}
			} else if self.eat("[") {
				let index = self.expression()?;
				self.expect("]")?;
				Expr::Index {
					object: Box::new(expr),
					index: Box::new(index),
					optional: false,
				}
			} else if self.eat("(") {
				Expr::Call {
					callee: Box::new(expr),
					arguments: self.arguments()?,
				}
			} else {
				return Ok(expr);
			};
		}
	}

	fn primary(&mut self) -> Result<Expr> {
		let offset = self.offset();
		Ok(match self.next() {
			Token::Number(n) => Expr::Literal(Value::Number(n)),
			Token::String(s) => Expr::Literal(Value::string(s)),
			Token::Template(chunks) => Expr::Template(
				chunks
					.into_iter()
					.map(|chunk| match chunk {
						Chunk::Text(text) => Ok(TemplatePart::Text(text.into())),
						Chunk::Source(source) => parse_expression(&source).map(TemplatePart::Expr),
					})
					.collect::<Result<_>>()?,
			),
			Token::Identifier(name) => match name.as_str() {
				"true" => Expr::Literal(Value::Bool(true)),
				"false" => Expr::Literal(Value::Bool(false)),
				"null" => Expr::Literal(Value::Null),
				"undefined" => Expr::Literal(Value::Undefined),
				"NaN" => Expr::Literal(Value::Number(f64::NAN)),
				"Infinity" => Expr::Literal(Value::Number(f64::INFINITY)),
				_ => Expr::Identifier(name.into()),
			},
			Token::Punct("(") => {
				let expr = self.expression()?;
				self.expect(")")?;
				expr
			}
			Token::Punct("[") => {
				let mut items = Vec::new();
				while !self.eat("]") {
					items.push(self.expression()?);
					if !self.eat(",") {
						self.expect("]")?;
						break;
					}
				}
				Expr::Array(items)
			}
			Token::Punct("{") => {
				let mut entries = Vec::new();
				while !self.eat("}") {
					let key: Rc<str> = match self.next() {
						Token::Identifier(name) | Token::String(name) => name.into(),
						Token::Number(n) => crate::value::number_to_string(n).into(),
						_ => {
							self.position -= 1;
							return Err(self.error("expected a property key"));
						}
					};
					let value = if self.eat(":") { self.expression()? } else { Expr::Identifier(key.clone()) };
					entries.push((key, value));
					if !self.eat(",") {
						self.expect("}")?;
						break;
					}
				}
				Expr::Object(entries)
			}
			token => {
				return Err(Error::Parse {
					expression: self.source.to_owned(),
					offset,
					message: format!("unexpected {}", describe(&token)),
				})
			}
		})
	}
}

fn describe(token: &Token) -> String {
	match token {
		Token::Number(n) => format!("number `{}`", n),
		Token::String(_) => "string".to_owned(),
		Token::Template(_) => "template literal".to_owned(),
		Token::Identifier(name) => format!("identifier `{}`", name),
		Token::Punct(punct) => format!("`{}`", punct),
		Token::End => "end of expression".to_owned(),
	}
}

fn parser(source: &str) -> Result<Parser<'_>> {
	Ok(Parser {
		source,
		tokens: Lexer { source, position: 0 }.tokenize()?,
		position: 0,
	})
}

/// Parses a `;`-separated statement sequence. An empty or blank source is an empty program.
pub fn parse_program(source: &str) -> Result<Program> {
	parser(source)?.program()
}

/// Parses exactly one expression.
pub fn parse_expression(source: &str) -> Result<Expr> {
	let mut parser = parser(source)?;
	let expr = parser.expression()?;
	match parser.peek() {
		Token::End => Ok(expr),
		_ => Err(parser.error("unexpected trailing input")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn precedence() {
		let expr = parse_expression("1 + 2 * 3 === 7 && !x").unwrap();
		let Expr::Logical(LogicalOperator::And, left, right) = expr else {
			panic!("not a logical and");
		};
		assert!(matches!(*left, Expr::Binary(BinaryOperator::StrictEqual, _, _)));
		assert!(matches!(*right, Expr::Unary(UnaryOperator::Not, _)));
	}

	#[test]
	fn assignment_targets() {
		let program = parse_program("$.count += 1; x = $.count").unwrap();
		assert_eq!(program.statements.len(), 2);
		assert!(matches!(
			&program.statements[0],
			Expr::Assign { target: AssignTarget::StateField(field), operator: Some(BinaryOperator::Add), .. } if &**field == "count"
		));
		assert!(parse_program("a + b = 1").is_err());
	}

	#[test]
	fn members_calls_and_literals() {
		let expr = parse_expression("fn(a.b?.c, [1, 'two'], { k: `x${y}` })[0]").unwrap();
		assert!(matches!(expr, Expr::Index { .. }));
	}

	#[test]
	fn conditional_with_numbers() {
		assert!(parse_expression("a?.5:1").is_ok());
		assert!(parse_expression("a ? b : c ? d : e").is_ok());
	}

	#[test]
	fn errors_carry_offsets() {
		let Err(Error::Parse { offset, .. }) = parse_expression("1 + )") else {
			panic!("expected a parse error");
		};
		assert_eq!(offset, 4);
		assert!(parse_program("'open").is_err());
	}

	#[test]
	fn blank_programs() {
		assert_eq!(parse_program("  ").unwrap().statements.len(), 0);
		assert_eq!(parse_program(";;a;").unwrap().statements.len(), 1);
	}
}
