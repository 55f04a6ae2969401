//! Centralized constants for the ordered replica set controller.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod network;
pub mod paths;
pub mod state;
