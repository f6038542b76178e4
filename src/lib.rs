//! Whitelist KYC API Library
//!
//! Token-sale whitelist registration with a two-stage identity verification
//! lifecycle, a document-check webhook reconciler and an analytics feed.
//!
//! # Modules
//!
//! - `api`: HTTP-facing handlers.
//! - `core`: Lifecycle, ledger and verification logic.
//! - `integrations`: External provider clients.
//! - `config`: Configuration management.
//! - `db`: Database connection and schema setup.
//! - `db_storage`: Postgres store.
//! - `store`: Store trait and in-memory store.
//! - `events`: Event dispatcher and observer trait.
//! - `state_machine`: Compare-and-set user transitions.
//! - `ledger`: Verification request/response records.
//! - `mapper`: Provider result mapping.
//! - `verification`: Info and ID verification orchestration.
//! - `reconciler`: Document provider webhook reconciliation.
//! - `observers`: Standard event observers.
//! - `service`: Operations exposed to the HTTP layer.
//! - `tokens`: Signed user tokens for the authenticated routes.

pub mod api;
pub mod core;
pub mod integrations;

pub mod analytics_client;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod documents;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod idm_client;
pub mod ledger;
pub mod mapper;
pub mod models;
pub mod observers;
pub mod onfido_client;
pub mod reconciler;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod tokens;
pub mod validation;
pub mod verification;
pub mod webhook_handler;
pub mod webhook_models;
