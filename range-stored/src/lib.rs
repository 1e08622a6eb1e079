//! The range replication daemon: worker threads for the paxos roles, the
//! UDP transport and datagram listener, the local request queue, proposer
//! heartbeating with failover, and bulk catch-up from a running peer.
//!
//! The storage and graph semantics live in the `range` crate; this crate
//! only moves requests around and applies what the cell agrees on.

pub mod client;
pub mod heartbeat;
pub mod listen;
pub mod mqserv;
pub mod network;
pub mod paxos;
pub mod queue;
pub mod replay;
pub mod signal;
pub mod supervisor;
pub mod worker;
