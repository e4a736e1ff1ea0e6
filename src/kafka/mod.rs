pub mod source;


pub use source::{KafkaPosition, KafkaSource, PartitionSpan};
