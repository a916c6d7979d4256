//! tenantdb: a multi-tenant document platform.
//!
//! Every registered app gets its own collection namespace, a scoped access
//! token and a schema it can extend at runtime. Collections are described in
//! a small schema language; the same description drives validation, query
//! translation and path updates. A collection may also be backed by a peer
//! instance through a data-sharing agreement or an app relationship, in
//! which case its CRUD calls are proxied over HTTP.
//!
//! Layers, bottom up:
//! - [`storage`]: sled trees of JSON documents, filters evaluated in-process
//! - [`schema`], [`query`], [`update`]: the schema-driven access layer
//! - [`collection`], [`federation`]: local, remote and split collections
//! - [`entities`], [`registry`], [`role`]: platform records, model lifecycle
//!   and row-level role filters
//! - [`rest`]: the Axum API served by the `tenantdb` binary

pub mod auth;
pub mod collection;
pub mod config;
pub mod document;
pub mod entities;
pub mod error;
pub mod federation;
pub mod filter;
pub mod ids;
pub mod logging;
pub mod models;
pub mod query;
pub mod realtime;
pub mod registry;
pub mod rest;
pub mod role;
pub mod schema;
pub mod storage;
pub mod update;
