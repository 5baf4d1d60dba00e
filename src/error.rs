use crate::{dom::NodeId, runtime::InstanceId};
use thiserror::Error;

/// Everything that can go wrong while compiling, evaluating or rendering.
///
/// Most of these are recovered from close to where they occur: a failing directive is logged and skipped,
/// and only structural faults abort a whole render pass (in which case [`after_render`](`crate::Lifecycle::after_render`) sees them).
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
	#[error("there can only be one `Runtime` per thread")]
	RuntimeExists,

	#[error("custom element names must contain a hyphen: `{0}`")]
	InvalidTagName(String),
	#[error("`{0}` is already registered")]
	AlreadyRegistered(String),
	#[error("`{0}` is not a registered component")]
	UnknownComponent(String),

	#[error("field names starting with `$` are reserved: `{field}`")]
	ReservedField { field: String },

	#[error("syntax error in `{expression}` at offset {offset}: {message}")]
	Parse { expression: String, offset: usize, message: String },
	#[error("{0} is not defined")]
	Reference(String),
	#[error("type error: {0}")]
	Type(String),
	#[error("range error: {0}")]
	Range(String),
	#[error("`{0}` is not a method of this component")]
	UnknownMethod(String),

	#[error("there can only be one `{0}` on a single node")]
	MultipleDirectives(&'static str),
	#[error("node {0:?} is marked as a `for` template but doesn't have the required values")]
	MissingRepeat(NodeId),
	#[error("nested loop anchor could not be resolved by path `{0}`")]
	AnchorNotFound(String),
	#[error("`<{0}>` can't be nested inside itself")]
	RecursiveComponent(String),
	#[error("component instance {0:?} is already running a hook")]
	ComponentBusy(InstanceId),

	#[error("the document can't hold any more nodes")]
	ArenaFull,
	#[error("node {0:?} was freed")]
	Freed(NodeId),
	#[error("hierarchy request error: {0}")]
	Hierarchy(&'static str),
	#[error("node {0:?} is not a child of the given parent")]
	NotAChild(NodeId),
	#[error("invalid selector `{0}`")]
	Selector(String),
	#[error("stylesheet rule index {index} is out of range for {len} rules")]
	RuleIndex { index: usize, len: usize },

	#[error("the event loop did not settle after {0} timer firings")]
	Unsettled(usize),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
