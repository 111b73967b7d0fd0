//! Repository traits for metadata operations.

pub mod entries;
pub mod prune_jobs;
pub mod uploads;

pub use entries::{EntryRepo, ReserveRequest};
pub use prune_jobs::PruneJobRepo;
pub use uploads::UploadRepo;
