pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use config::{RozConfig, Settings, SiteCredentials};
pub use core::{
    announce::Announcer, bucket_map::BucketMap, controller::Controller, ingest::IngestService,
    matcher::Matcher, notifications::NotificationService, validation::Validator,
};
pub use utils::error::{Result, RozError};
