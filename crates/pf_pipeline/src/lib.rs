//! Pipeline services: the business logic that sits between the
//! generic entity store (`pf_db`) and the generic task runtime
//! (`pf_worker`), plus the worker-boot recovery driver.

pub mod actors;
pub mod adapters;
pub mod coloring;
pub mod download;
pub mod ingest;
pub mod paths;
pub mod ports;
pub mod recovery;
pub mod selection;
pub mod vectorize;

pub use ports::{DiffusionClient, ObjectStore, UpstreamOrderClient, VectorizerClient};
