#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Lfhash is a lock-free, extensible hash table of fixed-size byte records,
//! together with the building blocks it is made of.
//!
//! - [`LfHash`] is the table. It keeps every element in one split-ordered
//!   list and grows by doubling its bucket count with a single
//!   compare-and-swap. No element is ever moved.
//! - [`PinRegistry`] and [`Pins`] implement per-worker hazard pointers
//!   ("pins") with batched, deferred reclamation of retired records.
//! - [`PooledAllocator`] recycles fixed-size records through a lock-free
//!   free stack, fed by the pin registry's reclamation.
//! - [`GrowableDirectory`] is a wait-free, append-only, multi-level array that
//!   hands out stable references to its slots.
//!
//! No operation takes a lock. A worker that loses a race retries its own
//! step, so one stalled worker never stops the others.
//!
//! # Example
//!
//! ```rust
//! use lfhash::{Error, LfHash};
//! use std::{sync::Arc, thread};
//!
//! # fn main() -> Result<(), Error> {
//! // Elements of 12 bytes: a 4-byte key followed by an 8-byte value.
//! let table = Arc::new(LfHash::new(12, 0, 4)?);
//!
//! let threads: Vec<_> = (0..4u32)
//!     .map(|i| {
//!         let table = Arc::clone(&table);
//!         thread::spawn(move || -> Result<(), Error> {
//!             // Every worker takes its own pin set once.
//!             let mut pins = table.pins()?;
//!             for j in 0..100u32 {
//!                 let key = i * 100 + j;
//!                 let mut element = [0u8; 12];
//!                 element[..4].copy_from_slice(&key.to_le_bytes());
//!                 element[4..].copy_from_slice(&u64::from(key * 2).to_le_bytes());
//!                 table.insert(&mut pins, &element)?;
//!             }
//!             Ok(())
//!         })
//!     })
//!     .collect();
//!
//! for t in threads {
//!     t.join().expect("worker panicked")?;
//! }
//!
//! let mut pins = table.pins()?;
//! assert_eq!(table.len(), 400);
//! let found = table.search(&mut pins, &123u32.to_le_bytes()).expect("present");
//! assert_eq!(&found[4..], &246u64.to_le_bytes());
//! # Ok(())
//! # }
//! ```
//!
//! # Minimum Supported Rust Versions
//!
//! This crate's minimum supported Rust version (MSRV) is 1.65.
//!
//! # Crate Features
//!
//! - `logging`: emits a few events through the [`log`][log-crate] crate, such
//!   as table growth and pin sets being created.
//! - `unstable-debug-counters`: exposes [`GlobalDebugCounters`] with
//!   process-wide counts of internal allocations. Not covered by semver.
//!
//! [log-crate]: https://crates.io/crates/log

pub(crate) mod alloc;
pub(crate) mod collation;
pub(crate) mod common;
pub(crate) mod directory;
pub(crate) mod hash;
pub(crate) mod pin;

pub use crate::alloc::{FreeStack, PooledAllocator};
pub use collation::{AsciiCaseInsensitive, BinaryCollation, Collation};
pub use common::error::Error;
pub use directory::GrowableDirectory;
pub use hash::{builder::LfHashBuilder, node::KeyLayout, Found, HashPins, LfHash};
pub use pin::{
    PinGuard, PinRegistry, PinScope, Pins, Reclaim, RetiredChain, RetiredIter, PINS_PER_SET,
    PURGATORY_SIZE,
};

#[cfg(feature = "unstable-debug-counters")]
#[cfg_attr(docsrs, doc(cfg(feature = "unstable-debug-counters")))]
pub use common::debug_counters::GlobalDebugCounters;
