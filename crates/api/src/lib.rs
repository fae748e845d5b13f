//! Beacon API server: REST notification routes, the WebSocket delivery
//! endpoint, health and Prometheus metrics.

pub mod middleware;
pub mod routes;
pub mod state;
