//! Gardener resources watched by the operator.
//!
//! Only the fields the operator reads are modelled; unknown fields are ignored on
//! deserialization and these types are never written back.

pub mod shoots;
pub mod shootstates;

pub use shoots::*;
pub use shootstates::*;
