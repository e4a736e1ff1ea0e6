pub mod decoder;
pub mod filter;
pub mod types;


pub use decoder::{FlatMessage, MessageFormat, StructuredMessage};
pub use filter::SubscriptionFilter;
pub use types::*;
