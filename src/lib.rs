// src/lib.rs

//! Conary Repository
//!
//! Trove changeset engine and transactional commit pipeline for a Conary
//! package repository.
//!
//! # Architecture
//!
//! - Troves: named, versioned, flavored units holding files and member troves
//! - Changesets: deltas between trove states, with a stable text wire form
//! - Content store: file contents addressed by SHA-1, deduplicated
//! - Commit: a changeset batch is applied in one SQLite transaction
//! - Capsules: foreign package payloads installed through registered installers

pub mod capsule;
pub mod cas;
pub mod changeset;
pub mod compression;
pub mod db;
pub mod deps;
mod error;
pub mod flavor;
pub mod hash;
pub mod repository;
pub mod signature;
pub mod trove;
pub mod version;

pub use error::{Error, Result};
