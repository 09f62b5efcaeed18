//! Background services

pub mod expiry_sweeper;
pub mod health_worker;

pub use expiry_sweeper::{ExpirySweeper, ExpirySweeperHandle};
pub use health_worker::{HealthWorker, HealthWorkerHandle};
