//! Release data model and the pure Release Selector (spec.md §4.4).

pub mod release;
pub mod selector;

pub use release::{Codec, Release, Resolution, Source};
pub use selector::{select, SelectionConstraints, SelectionResult};
