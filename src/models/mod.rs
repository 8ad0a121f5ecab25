//! Domain model module declarations.

pub mod ids;
pub mod status;
