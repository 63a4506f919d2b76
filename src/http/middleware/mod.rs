//! Request middleware.

pub mod enforcement;
