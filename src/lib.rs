// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Distributed cooperative edge cache.
//!
//! A fleet of edge nodes jointly caches objects in front of an authoritative
//! origin store. Each key hashes to a *beacon* edge that owns its directory
//! entry and write-lock state; edges satisfy local misses from peers via
//! directory lookup and redirection, and keep replicas coherent with an
//! MSI-style invalidate/block/wake protocol. The COVERED policy additionally
//! aggregates per-edge popularity at the beacon and places objects by
//! computed reward, piggybacking victim-sync state on control messages.

pub mod cli;
pub mod cloud;
pub mod config;
pub mod cooperation;
pub mod covered;
pub mod edge;
pub mod fleet;
pub mod message;
pub mod metadata;
pub mod net;
pub mod node;
pub mod store;
pub mod telemetry;
pub mod types;
