pub mod client;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod model;
pub mod remote;
pub mod result;
pub mod synchronizer;

pub use client::{BatchClient, PollOptions, SyncClient};
pub use error::{Result, SyncError};
pub use result::{SyncResult, SyncStatus};
pub use synchronizer::{synchronize_list, Synchronizer};
