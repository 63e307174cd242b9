//! Entity Store: the project's single source of truth.
//!
//! Four collaborating components sit behind [`UnitOfWork`], the only legal
//! mutation path, [`EventLog`] (C1, append-only audit record and per-branch
//! projection), [`RelationalIndex`] (C2, queryable mirror plus sync-metadata
//! and relationships), [`VectorIndex`] (C3, semantic search), and the YAML
//! file format in [`fs_store`]. Reads bypass the Unit of Work and go straight
//! to whichever component answers them fastest.

mod db;
mod error;
mod event_log;
mod fs_store;
mod model;
mod relational_index;
mod unit_of_work;
mod vector_index;

pub use error::EntityStoreError;
pub use event_log::{project_chain, EventLog};
pub use fs_store::{content_hash, parse_yaml, render_yaml};
pub use model::{Entity, Event, EventType, Relationship};
pub use relational_index::{yaml_path_for, RelationalIndex, SyncMetadata};
pub use unit_of_work::{CloudSyncSink, DeleteRequest, NoopCloudSync, SaveRequest, UnitOfWork};
pub use vector_index::VectorIndex;
