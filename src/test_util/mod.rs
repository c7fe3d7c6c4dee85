//! Utilities for testing code that uses DTPC. They are used for testing this crate itself, but
//!  they are also exported so applications can run daemons without a bundle layer.

pub mod transport;
