pub mod agent;
pub mod autoscale;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod pod;
