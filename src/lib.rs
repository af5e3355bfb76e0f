//! A bidirectional ASTM E1381/E1394 instrument gateway to an LIS message
//! bus: accepts TCP connections from lab instruments, drives the ASTM
//! handshake and frame protocol, parses and publishes results/queries, and
//! dispatches outbound orders back to the correct connected instrument.

pub mod broker;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod keepalive;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
