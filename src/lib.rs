// SPDX-License-Identifier: Apache-2.0

pub mod admin;
pub mod agent;
pub mod bounded_channel;
pub mod codecs;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod event;
pub mod harvester;
pub mod prospector;
pub mod publisher;
pub mod registrar;
pub mod spooler;
pub mod util;
