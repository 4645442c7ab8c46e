//! Home Assistant Built-in Components
//!
//! This crate contains implementations of Home Assistant's built-in components
//! (integrations) that don't require Python.

pub mod switch_as_x;

pub use switch_as_x::{
    register_switch_as_x, SwitchAsX, SwitchAsXError, SwitchAsXOptions, TargetDomain,
};
