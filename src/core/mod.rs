pub mod agent;
pub mod lifecycle;
pub mod metrics;
pub mod storage;
