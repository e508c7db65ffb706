//! Background services

pub mod analysis_scheduler;

pub use analysis_scheduler::{AnalysisScheduler, AnalysisSchedulerConfig, AnalysisSchedulerHandle};
