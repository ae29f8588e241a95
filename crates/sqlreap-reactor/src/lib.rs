//! Single-threaded readiness event loop.
//!
//! [`EventLoop`] maps OS handles to callbacks and dispatches them when the
//! handle becomes ready, using `mio` (epoll/kqueue) underneath.
//!
//! - One callback per handle; the latest `watch` wins
//! - Changes made from inside a callback go through a [`Registrar`] and take
//!   effect in the next iteration
//! - Optional idle timeout and per-iteration finish hooks
//! - [`StopHandle`] stops a running loop from another thread
//!
//! # Example
//!
//! ```rust,no_run
//! use std::os::fd::AsRawFd;
//! use sqlreap_reactor::{EventLoop, Handle};
//!
//! # fn main() -> sqlreap_core::Result<()> {
//! let (reader, _writer) = std::os::unix::net::UnixStream::pair()?;
//! let mut event_loop = EventLoop::new()?;
//! event_loop.watch(Handle::new(reader.as_raw_fd()), |registrar, handle| {
//!     println!("{handle} is readable");
//!     registrar.unwatch(handle);
//! });
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

pub mod event_loop;
pub mod handle;

pub use event_loop::{Callback, EventLoop, Hook, Registrar, StopHandle};
pub use handle::{Handle, Interest};
