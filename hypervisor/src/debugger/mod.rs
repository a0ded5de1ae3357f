//! The debugger built on the VM-exit handlers.
//!
//! Events and their actions, hidden hooks, breakpoints and stepping observe the guest; the
//! session halts every processor for the debugger, and the kd protocol and the IOCTL surface
//! carry its requests.

pub mod breakpoints;
pub mod broadcast;
pub mod callstack;
pub mod debug_registers;
pub mod disassembler;
pub mod events;
pub mod hooks;
pub mod ioctl;
pub mod kd;
pub mod messages;
pub mod script;
pub mod session;
pub mod stepping;
pub mod symbols;
pub mod transparency;
