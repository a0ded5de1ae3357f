//! Guest memory access from VMX root and the preallocated pools that back hooks.

pub mod mapper;
pub mod pool;
