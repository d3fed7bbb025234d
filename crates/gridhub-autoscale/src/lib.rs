//! gridhub-autoscale — utilization-driven pool sizing.
//!
//! Samples the worker pool each tick, compares aggregate utilization
//! against the configured target, and steers the desired worker count
//! within `[min_count, max_count]`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! aggregate = mean(load/capacity over Ready workers)
//! desired'  = ceil(ready_count × aggregate / target_utilization)
//! desired   = clamp(desired', min_count, max_count)
//!
//! desired > members: provision the difference (each new worker enters
//!                    Starting until its readiness probe passes)
//! desired < members: drain the difference (lowest load first, newest
//!                    first; removed once in-flight sessions finish)
//! ```
//!
//! Cooldown windows prevent rapid oscillation. Provisioning failures leave
//! the pool degraded at its current size and never stall routing.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision};
