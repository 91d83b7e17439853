// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pricewatch runtime library: headless-browser price monitoring.
//!
//! Pages are rendered through a pooled browser ([`session`]), read with
//! declarative rules ([`extract`]), compared with the previous reading
//! ([`detect`]) and appended to an exact price history ([`store`]). The
//! [`monitor`] module schedules all of it per target.

#![allow(clippy::new_without_default)]

pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod extract;
pub mod fetcher;
pub mod health;
pub mod model;
pub mod monitor;
pub mod renderer;
pub mod reprice;
pub mod session;
pub mod store;
pub mod targets;
