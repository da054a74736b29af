// Kafka module - batch consumption, per-partition workers and redelivery by rewind
pub mod batch_consumer;
pub mod batch_context;
pub mod config;
pub mod message;
pub mod offset_tracker;
pub mod partition_router;
pub mod partition_worker;
pub mod types;

pub use batch_consumer::{BatchConsumer, BatchConsumerConfig, BatchProcessor};
pub use config::ConsumerConfigBuilder;
