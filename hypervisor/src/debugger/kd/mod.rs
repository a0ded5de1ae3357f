//! The kernel debug protocol.
//!
//! A remote debugger talks to the debuggee over a serial line in framed packets. While the system
//! runs, the debuggee only watches the line for a pause request; once halted, the processor that
//! owns the session serves every request until the debugger continues.

pub mod commands;
pub mod dispatcher;
pub mod packet;
pub mod requests;
pub mod transport;

pub use {dispatcher::KdDebugger, transport::Transport};
