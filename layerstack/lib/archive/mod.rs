//! Content-addressed tar archiving of directory trees, and its inverse.
//!
//! [`create`] walks a glob-expanded source, applies ignore rules, resolves symlinks with
//! containment checks, and streams a tar archive to a temporary file while computing its
//! SHA-256 digest in the same pass. [`extract`] materializes such an archive under a
//! destination root, rejecting any entry that would escape it.

mod create;
mod digest;
mod extract;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use create::*;
pub use digest::*;
pub use extract::*;
