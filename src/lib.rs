//! Canopy keeps per-category aggregates (post counts, activity histograms and
//! attachment statistics) consistent while posts and categories move around
//! a shallow category tree.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod mirror;
pub(crate) mod util;
