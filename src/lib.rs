//! Client-side synchronization core for a hierarchical realtime database.
//!
//! A tree of JSON-like values lives on an authoritative server. Clients read
//! it through live, optionally filtered listeners and mutate it through
//! optimistic writes and compare-and-set transactions, while a duplex
//! connection delivers asynchronous server updates. This crate keeps the
//! local picture consistent and eventually convergent with the server.
//!
//! The crate is split in two:
//!
//! - [`mod@core`] is the synchronization logic as a pure state machine: the
//!   sync tree of filtered views, the pending-write log, the transaction
//!   engine, the on-disconnect tree, the push-id generator. It performs no IO.
//! - [`repo`] drives that state machine from a tokio actor wired to a
//!   [`repo::Connection`], and exposes the clone-able [`repo::Repo`] handle
//!   applications use.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod core;
pub mod repo;
