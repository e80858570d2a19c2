// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared state for API handlers.

use std::sync::Arc;
use std::time::Instant;

use kiln_core::cancel::CancelService;
use kiln_core::logs::LogService;
use kiln_core::retrigger::RetriggerService;
use kiln_core::trigger::TriggerService;

/// Everything the handlers need, shared across requests.
#[derive(Clone)]
pub struct AppState {
    /// Trigger orchestrator for manual and webhook builds.
    pub trigger: Arc<TriggerService>,
    /// Cancellation service.
    pub cancel: Arc<CancelService>,
    /// Snapshot replay service fed by executor status reports.
    pub retrigger: Arc<RetriggerService>,
    /// Log streaming and artifact downloads.
    pub logs: Arc<LogService>,
    /// When the server started, for uptime reporting.
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl AppState {
    /// Bundle the services behind one handler state.
    pub fn new(
        trigger: Arc<TriggerService>,
        cancel: Arc<CancelService>,
        retrigger: Arc<RetriggerService>,
        logs: Arc<LogService>,
    ) -> Self {
        Self {
            trigger,
            cancel,
            retrigger,
            logs,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
