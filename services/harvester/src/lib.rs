//! Carscan Harvester
//!
//! Bulk collection of car photos. The download phase walks the product
//! listing, derives every large-photo URL and fetches them concurrently into
//! a staging directory. The upload phase pushes each staged file to S3 under
//! its file name and makes it publicly readable. The phases never overlap:
//! all downloads finish before the first upload starts.
//!
//! Both phases run a bounded worker pool over one shared client and report
//! per-file outcomes instead of failing the run.

pub mod config;
pub mod fetcher;
pub mod listing;
pub mod publisher;

pub use config::Config;
pub use fetcher::{BulkFetcher, FetchReport, StagedFile, TransferError};
pub use listing::{ListingClient, ListingError, ListingItem};
pub use publisher::{BulkPublisher, ObjectStore, PublishError, PublishReport, S3ObjectStore};
