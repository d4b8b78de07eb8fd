//! API handlers module

pub mod documents;
pub mod health;
pub mod jobs;
pub mod query;
pub mod search;
pub mod usage;
