#![forbid(unsafe_code)]
//! Client-side remote filesystem namespace for Rust, speaking 9P2000.
//!
//! This crate grafts remote file trees and local paths into one
//! process-wide hierarchical name space, the way Plan 9 does it. A single
//! worker thread owns every connection to a 9P file server, the mount
//! table that resolves names, and all protocol state; application threads
//! drive it through a small synchronous API.
//!
//! # Overview
//!
//! 9P is Plan 9's remote filesystem protocol. A client negotiates a
//! version, attaches to a tree the server exports, and then walks, opens,
//! reads and writes files through integer handles called fids. This
//! library is the *client* side only: it dials nothing itself, but adopts
//! transport descriptors the application has already opened.
//!
//! # Getting started
//!
//! ```no_run
//! use std::os::fd::OwnedFd;
//! use std::os::unix::net::UnixStream;
//! use rfs9p::{Client, MountFlag, NOFID};
//!
//! fn main() -> rfs9p::Result<()> {
//!     let ns = Client::init()?;
//!
//!     // Adopt an open connection to a 9P server and mount its tree.
//!     let conn = UnixStream::connect("/srv/exportfs")?;
//!     ns.mount(OwnedFd::from(conn), NOFID, "/n/remote", MountFlag::REPL, "")?;
//!
//!     // Union a second source behind the same mount point.
//!     ns.bind("/n/remote/cfg", "/n/cfg", MountFlag::AFTER)?;
//!
//!     ns.unmount(None, "/n/remote")?;
//!     ns.deinit()
//! }
//! ```
//!
//! # Concurrency
//!
//! The API is safe to call from any number of threads. Internally the
//! system is single-threaded and cooperative: every mutation of the mount
//! table, the fids, the tags and the transports happens on the worker
//! thread's event loop. Caller threads only build their request
//! descriptor and block on the rendezvous until the worker hands it back.
//!
//! Requests from one thread execute in submission order. Across threads,
//! order is arrival order at the worker; no further fairness is promised.
//!
//! # Errors
//!
//! Failures surface as [`Error`], which always projects onto an errno;
//! server-side `Rerror` strings are mapped to the closest one. The worker
//! never panics on protocol input: malformed frames fail the request, and
//! a torn transport fails every outstanding request on that conversation
//! with `EIO` and severs its mount-table sources.
pub mod client;
pub mod conv;
pub mod error;
pub mod fcall;
pub mod namespace;
pub mod serialize;
#[macro_use]
pub mod utils;
mod worker;

pub use crate::client::Client;
pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::namespace::MountFlag;
pub use crate::utils::Result;
