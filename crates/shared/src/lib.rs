//! Data model shared between the engine and its external callers.
pub mod event;
pub mod rpc;
pub mod value;

pub use event::{ChangeEvent, ChangeSource, EventKind, SubscriptionFilter};
pub use rpc::{BatchOpResult, BatchOperation};
pub use value::Value;
