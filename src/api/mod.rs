//! Outbound calls to the ad-analytics platform

pub mod client;
pub mod conversion;

pub use client::build_http_client;
pub use conversion::{ConversionReporter, ReportError};
