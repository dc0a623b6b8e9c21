#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ocpp-bridge library: an OCPP-J proxy that sits between charge points and
//! their backend and repairs non-compliant traffic in flight.
//!
//! - `ocpp`: frame codec, actions, directions
//! - `pipeline`: ordered transform rules
//! - `workaround`: auto-responses, status overrides, injections
//! - `sessions`: session registry, relay loops, frame buffer, identity store
//! - `status`: per-session status snapshots
//! - `journal`: JSON-lines message log
//! - `dashboard`, `routes`, `auth`: query and command API
//! - `ws`: device listener and backend connector
//! - `server`: listeners and graceful shutdown

pub mod auth;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod journal;
pub mod ocpp;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod sessions;
pub mod state;
pub mod status;
pub mod util;
pub mod workaround;
pub mod ws;

pub use config::Config;
pub use dashboard::{Command, Dashboard};
pub use server::Server;
pub use sessions::SessionManager;
pub use state::AppState;
