//! Recording of scan results.

pub mod dataset;

pub use dataset::{Column, Dataset, DatasetStore, Row};
