//! wsgate: multi-tenant WebSocket gatekeeper and message broker.
//!
//! Clients connect to `/ws/{project}/{token}`. A connection is admitted when
//! the project exists, its `Origin` passes the project's domain policy and
//! the token verifies under the project's secret. Admitted connections can
//! broadcast to their project or address specific client identities in it,
//! across every broker instance linked into the mesh.

pub mod backplane;
pub mod config;
pub mod connection;
pub mod db;
pub mod domain;
pub mod handle;
pub mod mesh;
pub mod project;
pub mod registry;
pub mod server;
pub mod token;
pub mod web;
