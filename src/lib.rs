//! # Montaine
//!
//! Schema-driven ingestion of third-party APIs into historized records.
//!
//! Each configured integration fetches a JSON document, projects it through
//! a mapping schema, coerces its leaves with a typing schema, wraps every
//! value in a timestamped history entry, and appends new observations to the
//! stored record only when they differ from the latest one.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ Upstream │──▶│ Pipeline                     │──▶│  SQLite  │
//! │ HTTP API │   │ map → type → historize       │   │ records  │
//! └──────────┘   └──────────────┬───────────────┘   │ history  │
//!                               │                   └──────────┘
//!                               ▼
//!                         ┌──────────┐
//!                         │  Alerts  │
//!                         └──────────┘
//! ```
//!
//! The pure stages live in `montaine-core`; this crate adds configuration,
//! transport, persistence, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! montaine init                         # create database
//! montaine integrations                 # list integrations and health
//! montaine transform prices --input response.json
//! montaine run prices --user ana
//! montaine history prices
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite record and run history store |
//! | [`fetch`] | Upstream HTTP transport |
//! | [`params`] | Auto-run parameter derivation and validation |
//! | [`mailer`] | Failure alerts |
//! | [`pipeline`] | Run orchestration |
//! | [`progress`] | Run progress on stderr |
//! | [`integrations`] | Integration listing and health |
//! | [`transform`] | Offline schema iteration |
//! | [`history`] | Run history and stored records |
//! | [`run_cmd`] | `run` / `auto` commands |
//! | [`logging`] | tracing subscriber setup |

pub mod config;
pub mod db;
pub mod fetch;
pub mod history;
pub mod integrations;
pub mod logging;
pub mod mailer;
pub mod migrate;
pub mod params;
pub mod pipeline;
pub mod progress;
pub mod run_cmd;
pub mod sqlite_store;
pub mod transform;
