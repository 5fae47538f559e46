//! Storage layer for the evidence capture engine.
//!
//! Uses ReDB for embedded key-value storage with ACID transactions.
//! A single database file backs one engine instance: sessions, the
//! durable upload queue, the secure key store, and the audit log.

pub mod redb;

pub use self::redb::Storage;
