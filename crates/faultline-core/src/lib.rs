//! # faultline-core
//!
//! Safe building blocks shared by the faultline crates: the fault taxonomy and
//! report type, error enums, disposition configuration, and the managed object
//! model (lifetime-counted values, versioned type objects, frames with named
//! local slots, named callables) that the unsafe primitives in
//! `faultline-guard` operate on.

#![deny(unsafe_code)]

pub mod call;
pub mod config;
pub mod error;
pub mod fault;
pub mod frame;
pub mod object;
pub mod types;

pub use call::{CallScope, Callable, CallableRef, Kwargs};
pub use config::Disposition;
pub use error::{InitError, RuntimeError};
pub use fault::{FaultKind, FaultReport};
pub use frame::{Code, Frame, FrameRef};
pub use object::{Header, Instance, InstanceRef, Value, address_of, dereference_tracked};
pub use types::{TypeObject, TypeRef};
