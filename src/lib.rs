//! Fleet rollout orchestration.
//!
//! Builds a versioned artifact (source tarball or container image), then
//! drives a scripted sequence of remote operations per host: file transfer,
//! pre/post hooks, atomic symlink switch or service restart. Per-host
//! success and failure are tracked so a failed run can be resumed by
//! retrying only the hosts that failed.
//!
//! Entry point is [`dispatch::dispatch`], which runs one [`types::DeployRequest`]
//! against a [`store::Services`] bundle. Progress streams through the
//! [`channel::LogHub`] keyed per request, one logical channel per host.

pub mod build;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod store;
pub mod strategy;
pub mod types;

pub use error::{DeployError, Result};
