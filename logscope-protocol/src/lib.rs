//! Event model shared by every LogScope crate.
//!
//! Everything in here is plain data: log and span records, the normalised
//! value tree carried in `data`, correlation context and the envelopes used
//! to mirror a store into another window. Behaviour lives in
//! `logscope-store`.

pub mod event;
pub mod transport;

pub mod prelude {
    pub use crate::event::{
        merge_context, ContextMap, ContextValue, LogEvent, LogLevel, LogValue, Source,
        SpanEvent, SpanStatus,
    };
    pub use crate::transport::{TransportEnvelope, TransportMessage, CHANNEL_NAME};
}

/// Builds a [`event::ContextMap`] from `key => value` pairs.
///
/// ```
/// use logscope_protocol::context;
///
/// let ctx = context! { "env" => "dev", "attempt" => 2 };
/// assert_eq!(ctx.len(), 2);
/// ```
#[macro_export]
macro_rules! context {
    () => {
        $crate::event::ContextMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::event::ContextMap::new();
        $(
            map.insert(
                ::std::string::String::from($key),
                $crate::event::ContextValue::from($value),
            );
        )+
        map
    }};
}
