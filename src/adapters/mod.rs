// Adapters layer: concrete implementations of the domain ports.

pub mod amqp;
pub mod memory;
pub mod nextflow;
pub mod onyx;
pub mod pathogenwatch;
pub mod s3;
pub mod slack;

pub use amqp::AmqpBus;
pub use memory::{MemoryBus, MemoryStore};
pub use nextflow::NextflowRunner;
pub use onyx::OnyxClient;
pub use pathogenwatch::PathogenwatchClient;
pub use s3::{S3Store, S3StoreFactory};
pub use slack::SlackWebhook;
