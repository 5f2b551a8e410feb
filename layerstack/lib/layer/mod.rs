//! Directory-backed filesystem layers and their union composition.
//!
//! A [`Layer`] is one directory in the stack; a [`Filesystem`] composes an ordered
//! stack of layers into a single overlay union mount, where every layer but the
//! topmost is read-only.

mod filesystem;
mod layer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use filesystem::*;
pub use layer::*;
