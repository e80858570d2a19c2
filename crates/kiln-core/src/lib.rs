// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Core - CI Trigger & Workflow Orchestration Engine
//!
//! This crate turns code changes into container builds. It resolves which
//! commits to build, composes the workflow submission, drives the build's
//! lifecycle, and serves its logs and artifacts, persisting all state to
//! PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                 │
//! │                   (kiln-server HTTP API, git sensor)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!            manual triggers, webhooks, status events, log requests
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          kiln-core (This Crate)                          │
//! │                                                                          │
//! │   MaterialResolver ─► RequestBuilder ─► TriggerService ─► Executor       │
//! │        │                   │                 │                           │
//! │    GitSensor        CustomTagService    CancelService                    │
//! │                     StepAssembler       RetriggerService                 │
//! │                                         LogService                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                       │
//!           ▼                        ▼                       ▼
//! ┌───────────────────┐   ┌───────────────────┐   ┌───────────────────────┐
//! │    PostgreSQL     │   │ Workflow Executor │   │     Blob Storage      │
//! │ (pipelines, runs, │   │  (Argo / system,  │   │ (logs, artifacts,     │
//! │  snapshots, tags) │   │   per cluster)    │   │  build cache)         │
//! └───────────────────┘   └───────────────────┘   └───────────────────────┘
//! ```
//!
//! # Trigger Lifecycle
//!
//! A build workflow moves through a small state machine:
//!
//! ```text
//! Starting ──► Running ──► Succeeded | Failed | Cancelled | Aborted
//! ```
//!
//! Only `Starting` and `Running` are live; a workflow in a terminal state is
//! never updated again. The trigger flow:
//!
//! 1. Resolve every active material to a commit ([`material::MaterialResolver`])
//! 2. Persist the workflow in `Starting` with its commit map
//! 3. Resolve the image tag, custom or deterministic ([`image_tag`])
//! 4. Assemble hook stages and plugin expansions ([`steps::StepAssembler`])
//! 5. Compose the submission object ([`request::RequestBuilder`])
//! 6. Snapshot the submission for replay ([`persistence::Persistence`])
//! 7. Abort superseded in-flight builds of the same pipeline
//! 8. Submit to the executor ([`executor::WorkflowExecutor`])
//!
//! Lost pods replay the stored snapshot as a new descendant workflow
//! ([`retrigger::RetriggerService`]), bounded by a retry budget.
//!
//! # Image Path Reservations
//!
//! Custom-tagged builds and copy plugin destinations claim their fully
//! qualified image path in a global reservation table before the build
//! starts. Two builds can therefore never push the same path; the loser
//! fails fast with `ImagePathInUse`. Cancellation releases every
//! reservation the build held.
//!
//! # External Seams
//!
//! The engine talks to the outside world only through traits, each with an
//! in-memory mock for tests:
//!
//! | Seam | Trait | Backs |
//! |------|-------|-------|
//! | Storage | [`persistence::Persistence`] | PostgreSQL |
//! | Git | [`sensor::GitSensor`] | commit and webhook lookup |
//! | Execution | [`executor::WorkflowExecutor`] | workflow submit/terminate/logs |
//! | Registries | [`registry::RegistryClient`] | credentials, ECR repositories |
//! | Clusters | [`cluster::ClusterGateway`] | external cluster access |
//! | Blobs | [`blob::BlobStorage`] | stored logs and artifacts |

#![deny(missing_docs)]

pub mod blob;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod image_tag;
pub mod logs;
pub mod material;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod request;
pub mod retrigger;
pub mod sensor;
pub mod steps;
pub mod tasks;
pub mod test_support;
pub mod trigger;

pub use config::{BlobConfig, Config, ConfigError};
pub use error::{CoreError, Result};
