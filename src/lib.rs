pub mod config;
pub mod consumer;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod registry;

pub mod kafka;
pub mod message;

pub use config::Config;
pub use consumer::{BatchSource, ConsumerClient, ConsumerHandle, ConsumerStats, PulledBatch};
pub use convert::{EntityMetadata, MetadataCatalog, TypedRow};
pub use dispatch::{BatchOutcome, DispatchMode, MessageHandler};
pub use error::{ConversionError, DispatchError, Error, Result};
pub use handler::{handle_row_data, EntryListener};
pub use registry::ListenerRegistry;
