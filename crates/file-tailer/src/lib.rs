// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # File Tailer
//!
//! Follows a growing, periodically rotated log file and ships every complete
//! line to a remote stream, surviving restarts without losing data.
//!
//! ## Architecture
//!
//! Each configured file is served by one [`pipe::Pipe`]:
//!
//! ```text
//!  source file ──► Tailer ──► EventQueue ──► Uploader ──► StreamWriter
//!                    │          (bounded)       │
//!                    ▼                          ▼
//!               PipeMetrics ◄───────────── CheckpointStore
//! ```
//!
//! - [`tailer`]: polls the file, follows rotation and emits one event per record
//! - [`queue`]: bounded hand-off providing backpressure
//! - [`uploader`]: packs events, writes them concurrently and checkpoints full packs
//! - [`checkpoint`]: persists how far the pipe has durably progressed
//! - [`metrics`]: lock-free counters flushed periodically to a CSV file
//! - [`pipe`] and [`manager`]: lifecycle of one pipe and of all configured pipes
//!
//! Delivery is at-least-once: a restart may replay up to one pack of events.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod auth;
pub mod charset;
pub mod checkpoint;
pub mod config;
pub mod event;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod pack;
pub mod pipe;
pub mod queue;
pub mod retry;
pub mod tailer;
pub mod uploader;
pub mod writer;
