pub mod archive;
pub mod broker;
pub mod config;
pub mod corpus;
pub mod crash;
pub mod fuzz;
pub mod scheduler;
pub mod seeds;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod watchdog;
