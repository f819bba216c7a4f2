/*
 * 5D Labs Agent Platform - Script Pod Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Script pod lifecycle library
//!
//! Deployment scripts run as ephemeral pods. This crate keeps an authoritative,
//! restart-safe view of every script pod, streams their ordered (and optionally
//! encrypted) logs back to the caller exactly once, and cleans up pods that were
//! never collected or never got scheduled.

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod logs;
pub mod pods;
pub mod scripts;
pub mod supervisor;
pub mod ticket;
pub mod watchdog;
pub mod watermark;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use agent::ScriptPodAgent;
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use logs::{ProcessOutput, ProcessOutputSource};
pub use pods::{PodMonitor, PodState, PodStatus};
pub use scripts::{ProcessState, ScriptPodService, ScriptStatusResponse};
pub use ticket::ScriptTicket;
