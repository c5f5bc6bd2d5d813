//! Built-in notifiers.
//!
//! Each submodule contributes a descriptor; the registry enables a notifier
//! only when its namespace appears in the configuration file.

pub mod console;
pub mod webhook;

use crate::notify::NotifierDescriptor;

/// The static registration list.
#[must_use]
pub fn descriptors() -> Vec<NotifierDescriptor> {
    vec![console::descriptor(), webhook::descriptor()]
}
