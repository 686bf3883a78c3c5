//! # Architecture Abstraction Layer
//!
//! Provides the context-switch boundary for the scheduler. The only port is
//! the hosted one, where every kernel thread is backed by a host OS thread
//! and "switching context" means handing the CPU token to another thread.

pub mod host;
