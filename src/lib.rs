//! An in-memory, multi-type key/value store served over a custom binary
//! TCP protocol.
//!
//! The data path is a single-threaded poll loop: sockets are multiplexed
//! with `poll(2)`, complete frames are decoded into command token arrays,
//! handlers mutate the keyspace, and tagged responses are buffered back
//! out. The keyspace is an incrementally-resized chained hash table over
//! an entry arena; sorted sets ride on a size-augmented AVL tree, key
//! expiration on an array min-heap, and cardinality estimation on a
//! dense/sparse HyperLogLog. A small worker pool absorbs the teardown of
//! very large containers so the serving thread never stalls on a free.

pub mod avl;
pub mod buf;
pub mod clock;
pub mod commands;
pub mod db;
pub mod hash;
pub mod heap;
pub mod hll;
pub mod hmap;
pub mod list;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod zset;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
