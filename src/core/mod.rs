pub mod announce;
pub mod bucket_map;
pub mod controller;
pub mod ingest;
pub mod matcher;
pub mod notifications;
pub mod policy;
pub mod records;
pub mod validation;

pub use crate::domain::model::{IngestPayload, MatchedPayload, S3Event};
pub use crate::domain::ports::{MessageBus, ObjectStore, OnyxApi, PipelineRunner};
pub use crate::utils::error::Result;
