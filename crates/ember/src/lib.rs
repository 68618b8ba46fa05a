//! A library implementing the control plane of a Container Storage
//! Interface (CSI) plugin for arbitrary block-storage backends.
//!
//! The crate provides the three CSI gRPC services (Identity, Controller,
//! Node), the capability and topology rules behind them, per-request
//! idempotency serialization, and a persistence layer that keeps volumes,
//! snapshots and connections either in a relational database or in
//! Kubernetes custom resources. The storage backend itself is reached
//! through the [`driver::StorageDriver`] and [`connector::VolumeConnector`]
//! traits.
//!
//! The usual way to consume the crate is [`server::run`] with a
//! [`config::Config`] read from the environment, which is exactly what the
//! `ember-csi` binary does.

pub mod capability;
pub mod config;
pub mod connector;
pub mod controller;
pub mod driver;
pub mod errors;
pub mod grpc_sock;
pub mod identity;
pub mod mount;
pub mod node;
pub mod object;
pub mod persistence;
pub mod plugin;
pub mod rpc;
pub mod serializer;
pub mod server;
pub mod topology;

pub use config::Config;
pub use server::run;
