// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow executor seam.
//!
//! The executor owns the Kubernetes side of a build: submitting the workflow
//! object, terminating it, and tailing pod logs. The trigger engine treats it
//! as opaque; the only contract is this trait.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::cluster::ClusterConfig;
use crate::model::{ExecutorType, WorkflowRequest, WorkflowStatus};

/// Message executors report when the build pod disappeared underneath them.
pub const POD_DELETED_MESSAGE: &str = "pod deleted";

/// A stream of log chunks from a running or finished pod.
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Errors from the workflow executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor has no workflow by this name.
    #[error("cannot find workflow {0}")]
    WorkflowNotFound(String),

    /// Submission was rejected or the API call failed.
    #[error("workflow submit failed: {0}")]
    Submit(String),

    /// Termination failed for a reason other than the workflow being gone.
    #[error("workflow terminate failed: {0}")]
    Terminate(String),

    /// Log streaming failed.
    #[error("log stream failed: {0}")]
    Logs(String),
}

/// A termination order for one workflow.
#[derive(Debug, Clone, Default)]
pub struct TerminationRequest {
    /// Workflow object name, `{workflowId}-{workflowName}`.
    pub workflow_name: String,
    /// Namespace the workflow runs in.
    pub namespace: String,
    /// Executor backend that ran the workflow.
    pub executor_type: ExecutorType,
    /// Cluster the workflow runs in, absent for the local cluster.
    pub cluster: Option<ClusterConfig>,
}

/// A log tail request for one workflow pod.
#[derive(Debug, Clone, Default)]
pub struct LogRequest {
    /// Workflow object name.
    pub workflow_name: String,
    /// Pod to tail.
    pub pod_name: String,
    /// Namespace the pod runs in.
    pub namespace: String,
    /// Follow the stream until the pod finishes.
    pub follow: bool,
    /// Cluster the pod runs in, absent for the local cluster.
    pub cluster: Option<ClusterConfig>,
}

/// Client for the build execution backend.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Submit a workflow for execution.
    async fn submit(&self, request: &WorkflowRequest) -> Result<(), ExecutorError>;

    /// Terminate a workflow by name.
    async fn terminate(&self, request: &TerminationRequest) -> Result<(), ExecutorError>;

    /// Terminate leftover workflow objects matching the name, for workflows
    /// the primary terminate path no longer finds.
    async fn terminate_dangling(&self, request: &TerminationRequest)
    -> Result<(), ExecutorError>;

    /// Open a log stream for a workflow pod.
    async fn stream_logs(&self, request: &LogRequest) -> Result<LogStream, ExecutorError>;
}

/// Whether a status report warrants replaying the workflow from its snapshot.
///
/// Only pod disappearance on a still-unfinished workflow qualifies. Ordinary
/// build failures are final; the user decides whether to run again.
pub fn retrigger_required(pod_status: &str, message: &str, status: WorkflowStatus) -> bool {
    !status.is_terminal()
        && pod_status == crate::model::POD_STATUS_FAILED
        && message.contains(POD_DELETED_MESSAGE)
}

// ============================================================================
// Mock
// ============================================================================

/// In-memory [`WorkflowExecutor`] for tests.
///
/// Records every call; failure modes are opt-in through the constructors and
/// setters.
#[derive(Default)]
pub struct MockExecutor {
    submissions: Mutex<Vec<WorkflowRequest>>,
    terminations: Mutex<Vec<TerminationRequest>>,
    dangling_terminations: Mutex<Vec<TerminationRequest>>,
    unknown_workflows: Mutex<HashSet<String>>,
    log_lines: Mutex<Vec<Bytes>>,
    fail_submit: bool,
    fail_logs: bool,
}

impl MockExecutor {
    /// An executor that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor rejecting every submission.
    pub fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Default::default()
        }
    }

    /// An executor whose log streams cannot be opened.
    pub fn failing_logs() -> Self {
        Self {
            fail_logs: true,
            ..Default::default()
        }
    }

    /// Make `terminate` report this workflow name as unknown.
    pub fn forget_workflow(&self, workflow_name: &str) {
        self.unknown_workflows
            .lock()
            .unwrap()
            .insert(workflow_name.to_string());
    }

    /// Seed log chunks served by `stream_logs`.
    pub fn set_log_lines(&self, lines: Vec<&str>) {
        *self.log_lines.lock().unwrap() = lines
            .into_iter()
            .map(|l| Bytes::from(l.to_string()))
            .collect();
    }

    /// Requests passed to `submit` so far.
    pub fn submissions(&self) -> Vec<WorkflowRequest> {
        self.submissions.lock().unwrap().clone()
    }

    /// Requests passed to `terminate` so far.
    pub fn terminations(&self) -> Vec<TerminationRequest> {
        self.terminations.lock().unwrap().clone()
    }

    /// Requests passed to `terminate_dangling` so far.
    pub fn dangling_terminations(&self) -> Vec<TerminationRequest> {
        self.dangling_terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowExecutor for MockExecutor {
    async fn submit(&self, request: &WorkflowRequest) -> Result<(), ExecutorError> {
        if self.fail_submit {
            return Err(ExecutorError::Submit("mock submit rejected".to_string()));
        }
        self.submissions.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn terminate(&self, request: &TerminationRequest) -> Result<(), ExecutorError> {
        if self
            .unknown_workflows
            .lock()
            .unwrap()
            .contains(&request.workflow_name)
        {
            return Err(ExecutorError::WorkflowNotFound(
                request.workflow_name.clone(),
            ));
        }
        self.terminations.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn terminate_dangling(
        &self,
        request: &TerminationRequest,
    ) -> Result<(), ExecutorError> {
        self.dangling_terminations
            .lock()
            .unwrap()
            .push(request.clone());
        Ok(())
    }

    async fn stream_logs(&self, _request: &LogRequest) -> Result<LogStream, ExecutorError> {
        if self.fail_logs {
            return Err(ExecutorError::Logs("mock log stream down".to_string()));
        }
        let lines = self.log_lines.lock().unwrap().clone();
        Ok(Box::pin(futures::stream::iter(
            lines.into_iter().map(Ok),
        )))
    }
}
