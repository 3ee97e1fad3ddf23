//! sinkdns - a recursive-forwarding DNS resolver with a policy-driven
//! sinkhole.
//!
//! Queries for names on the configured hosts lists are answered locally
//! ("hijacked"); everything else is raced across the configured upstreams,
//! cached, and optionally recorded to a SQLite request log. This library
//! exposes the building blocks for the `sinkdns` binary and for tests; the
//! read APIs ([`cache::Cache::list`], [`querylog::QueryLog::read`]) are what
//! the inspection surface consumes.

pub mod cache;
pub mod client;
pub mod config;
pub mod dnsutil;
pub mod hosts;
pub mod loader;
pub mod persist;
pub mod proxy;
pub mod querylog;
pub mod server;
pub mod sql;
