mod context;
mod level;
mod log;
mod source;
mod span;
mod value;

pub use context::{merge_context, ContextMap, ContextValue};
pub use level::{LogLevel, UnknownLevel};
pub use log::LogEvent;
pub use source::{Source, UNKNOWN_FILE};
pub use span::{SpanEvent, SpanStatus};
pub use value::{LogValue, CIRCULAR_SENTINEL, UNCLONEABLE_SENTINEL};
