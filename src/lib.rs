pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod routes;
pub mod schema;
pub mod search;
pub mod state;
pub mod storage;
pub mod strategy;
pub mod workers;

pub use queue::{Enqueuer, JobKind, JobQueue, QueueName};
pub use workers::Dispatcher;
