//! A parser and archive index for Tor directory documents.
//!
//! This crate reads documents as archived by
//! [CollecTor](https://collector.torproject.org/), i.e. prefixed with a
//! `@type` annotation, and parses them as specified in
//! [dir-spec](https://gitlab.torproject.org/tpo/core/torspec/-/blob/main/dir-spec.txt).
//! For now, consensus documents (`@type network-status-consensus-3`) and
//! relay server descriptors (`@type server-descriptor`) are supported, and
//! only a limited subset of their fields is decoded.
//!
//! Archives hold many records per file. [`records::RecordStream`] extracts
//! them lazily, and [`archive::ArchiveResolver`] finds a single descriptor by
//! its digest in a dated archive:
//!
//! ```no_run
//! use chrono::NaiveDate;
//!
//! let date = NaiveDate::from_ymd_opt(2014, 12, 8).unwrap();
//! let desc = dirdoc::load_descriptor_from_digest(
//!     "collector/server-descriptors",
//!     "7aef3ff4d6a3b20c03ebefef94e6dfca4d9b663a",
//!     &date,
//! )?;
//! println!("{} {}", desc.nickname, desc.fingerprint);
//! # Ok::<(), dirdoc::error::ArchiveError>(())
//! ```
//!
//! Please be aware that the API is currently _very_ unfinished and will likely
//! change soon in an incompatible way.

pub mod annotation;
#[doc(inline)]
pub use annotation::{AcceptanceSet, Annotation};

pub mod fingerprint;
#[doc(inline)]
pub use fingerprint::Fingerprint;

pub mod records;

pub mod archive;
#[doc(inline)]
pub use archive::{load_descriptor_from_digest, ArchiveResolver};

pub mod consensus;
#[doc(inline)]
pub use consensus::Consensus;

pub mod descriptor;
#[doc(inline)]
pub use descriptor::Descriptor;

pub mod error;

pub mod meta;
