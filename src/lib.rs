pub mod agent;
pub mod bus;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod mqtt;
pub mod negotiation;
pub mod plasticity;
pub mod scheduler;
pub mod transport;
