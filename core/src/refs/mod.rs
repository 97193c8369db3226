//! Client references to interpreter values
//!
//! A [`Reference`] names a value by path (scope, member, stack frame, ...).
//! The [`Registry`] pins resolved values behind integer handles so clients
//! can keep pointing at them cheaply.

pub mod reference;
pub mod registry;
pub mod resolver;

#[cfg(test)]
mod tests;

pub use reference::Reference;
pub use registry::{Handle, Registry};
pub use resolver::{attributes, list_element, resolve, set_value, ResolveContext};
