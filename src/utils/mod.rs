//! Small shared helpers.

pub mod exec;
pub mod mime;
pub mod path;
