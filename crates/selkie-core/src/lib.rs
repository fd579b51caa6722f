//! Selkie Core
//!
//! Core types, errors, and constants for the Selkie virtual actor runtime.
//!
//! # Overview
//!
//! Selkie is a distributed virtual-actor runtime: a cluster of server nodes
//! collectively hosts a large, sparse population of named, single-threaded,
//! stateful actors and routes invocations to them. An actor has a stable
//! identity `(namespace, actor_id)`; at any moment it is activated on at
//! most one server, migrating implicitly in response to load, node churn,
//! or balancing decisions.
//!
//! This crate holds the vocabulary shared by every other Selkie crate:
//! identities, actor references, load snapshots, error kinds (with their
//! HTTP status mapping), cluster-wide limits, and the host-call payload
//! codecs exposed to actor user code.

pub mod constants;
pub mod error;
pub mod hostcall;
pub mod types;

pub use constants::*;
pub use error::{Error, Result};
pub use types::{
    ActorId, ActorMemory, ActorOptions, ActorReference, CreateActorResult,
    EnsureActivationRequest, HeartbeatResult, LoadSnapshot, ModuleOptions, ReferenceKind,
    RegisterModuleResult, ServerId, ServerSnapshot,
};
