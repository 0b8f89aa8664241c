//! # calibre-rest
//!
//! An HTTP CRUD API for a calibre e-book library, implemented by driving the
//! `calibredb` command-line tool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────────┐   ┌───────────┐
//! │   HTTP   │──▶│  Library  │──▶│ ProcessGateway │──▶│ calibredb │
//! │  (axum)  │   │  facade   │   │  (one lock)    │   └───────────┘
//! └──────────┘   └─────┬─────┘   └───────────────┘
//!                      │
//!        ┌─────────────┼──────────────┬──────────────┐
//!        ▼             ▼              ▼              ▼
//!   ┌────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐
//!   │ flags  │   │  query   │   │ outcome  │   │ pagination │
//!   └────────┘   └──────────┘   └──────────┘   └────────────┘
//! ```
//!
//! calibredb forbids overlapping operations on a library, so every
//! invocation is serialized through a single lock owned by the gateway.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and command-line overrides |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Book metadata |
//! | [`flags`] | Book → calibredb flag encoding |
//! | [`process`] | Serialized process execution |
//! | [`outcome`] | Classification of `calibredb add` output |
//! | [`query`] | Sort and search translation |
//! | [`pagination`] | Offset pagination and navigation links |
//! | [`library`] | The gateway facade |
//! | [`server`] | HTTP server |

pub mod config;
pub mod error;
pub mod flags;
pub mod library;
pub mod models;
pub mod outcome;
pub mod pagination;
pub mod process;
pub mod query;
pub mod server;
