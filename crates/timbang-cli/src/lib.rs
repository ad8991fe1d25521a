//! # timbang-cli
//!
//! Command line front-end for timbang: argument parsing, logging setup and
//! the commands driving [`timbang_core`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod cli;
pub mod commands;
pub mod logging;
pub mod state;
