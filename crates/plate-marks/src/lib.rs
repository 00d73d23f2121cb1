mod commands;
mod config;
mod core;
mod error;
mod interceptor;
mod marks;
mod normalize;
mod ops;
mod substrate;

pub use crate::config::*;
pub use crate::core::*;
pub use crate::error::*;
pub use crate::interceptor::*;
pub use crate::marks::*;
pub use crate::normalize::*;
pub use crate::ops::*;
pub use crate::substrate::*;
