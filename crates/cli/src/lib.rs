//! Support code for the `kvsdpa` command-line tool.

pub mod decode;
pub mod logging;
