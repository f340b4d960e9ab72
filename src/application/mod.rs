//! Application services layer.

pub mod categories;
pub mod error;
pub mod outcomes;
pub mod posts;
pub mod repos;
pub mod uploads;
