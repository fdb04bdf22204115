// SPDX-License-Identifier: Apache-2.0

//! Snapshot tree describing the running agent.
//!
//! Every pipeline segment registers a branch under the root [`Node`]. The tree
//! can be summarised, rendered in full as JSON or as indented text, and
//! individual entries can be called with parameters.

pub mod api;

pub use api::{ApiError, CallbackEntry, DataEntry, KeyValue, Navigable, Node, Params, Value};
