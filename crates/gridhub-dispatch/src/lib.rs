//! gridhub-dispatch — the client-side dispatch controller.
//!
//! Runs one logical test session at a time: request a session, route it to
//! a worker through the service endpoint, stream the command sequence, and
//! collect the result. Transport failures and worker faults are retried on
//! a different worker with a short backoff, up to a bounded retry count;
//! each attempt is confined entirely to one worker, so a failed attempt is
//! discarded whole and never partially applied across two workers.

pub mod client;
pub mod controller;

pub use client::{ClientError, Command, CommandOutcome, HttpWorkerClient, SessionResult, WorkerClient};
pub use controller::{DispatchConfig, DispatchController, DispatchError};
