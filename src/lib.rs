pub mod config;
pub mod control;
pub mod daemon;
pub mod datagram;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod link_core;
pub mod listener;
pub mod logging;
pub mod peer;
pub mod registry;
pub mod store;
pub mod telemetry;
