// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fault tolerance for backing-store access: circuit breaker and retry policies.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use retry::{retry, Backoff, RetryConfig};
