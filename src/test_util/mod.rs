//! This module contains utilities for testing code that sends or receives messages over a
//!  [crate::node::CluckNode]. They are used for testing the bus itself, but they are also exported
//!  for application testing.

pub mod recording_link;
