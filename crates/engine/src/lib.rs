//! Delivery orchestration core: presence, fan-out, priority policy, the
//! online/offline delivery decision, durable retries and rate limiting.

pub mod delivery;
pub mod email;
pub mod gateway;
pub mod presence;
pub mod priority;
pub mod rate_limiter;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod service;
pub mod sweeps;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
