//! Core engine: the control loop, the order worker and metrics reporting.

pub mod controller;
pub mod orders;
pub mod reporting;
