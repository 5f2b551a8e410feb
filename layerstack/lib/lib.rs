//! `layerstack` manages the on-disk layer stack of a container-style image build.
//!
//! # Overview
//!
//! A build composes an ordered set of directory [`layer::Layer`]s into a single writable
//! union view via an overlay mount ([`layer::Filesystem`]), and serializes any directory
//! subtree — including a mounted union view — into a content-addressed tar archive
//! ([`archive::create`]) that can later be safely re-materialized ([`archive::extract`]).
//!
//! # Key Properties
//!
//! - **Union composition**: lower layers are read-only and consulted in the given order;
//!   only the topmost layer receives writes.
//! - **Content addressing**: the SHA-256 digest of an archive is computed while the tar
//!   stream is written, in one pass and with bounded memory.
//! - **Containment**: symlinks that resolve outside the archived root, and archive
//!   entries that resolve outside the extraction root, are rejected rather than followed.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use layerstack::layer::{Filesystem, Layer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let base = Layer::new("base", "/var/lib/build")?;
//!     let top = Layer::new("top", "/var/lib/build")?;
//!
//!     let mut fs = Filesystem::builder()
//!         .layers(vec![base, top])
//!         .mountpoint("/mnt/build")
//!         .build();
//!
//!     fs.mount("/var/lib/build/work").await?;
//!     let tarball = fs.flatten().await?;
//!     fs.unmount().await?;
//!
//!     println!("{} -> {}", tarball.path().display(), tarball.digest());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod archive;
pub mod layer;
pub mod utils;

pub use error::*;
