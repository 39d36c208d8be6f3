// SPDX-License-Identifier: MIT
//! tabd — a daemon backing editor plugins with AI-driven inline completions
//! and cursor predictions.
//!
//! The library is organized around one event-driven [`engine::Engine`] that
//! owns all mutable state, a [`provider`] pipeline that turns raw model
//! output into normalized edits, and a [`text`] layer for diffing, staging,
//! and trimming. Editor frontends implement the [`editor`] traits and feed
//! events to the engine; they never reach into its state directly.

pub mod client;
pub mod config;
pub mod editor;
pub mod engine;
pub mod provider;
pub mod text;
pub mod types;
