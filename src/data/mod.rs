//! Trend segmentation and sample export.

pub mod export;
pub mod storage;
pub mod trend;
