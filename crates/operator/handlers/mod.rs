pub mod clusters;
pub mod df;
pub mod health;
pub mod metrics;
