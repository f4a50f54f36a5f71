mod args;
mod cache;
mod coalesce;
mod common;
mod error;
mod format;
mod memory;
mod merge;
mod normalization;
mod spatial;
mod store;

pub use args::*;
pub use cache::*;
pub use coalesce::*;
pub use common::*;
pub use error::*;
pub use memory::*;
pub use merge::*;
pub use normalization::*;
pub use spatial::*;
pub use store::*;
