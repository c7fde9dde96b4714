//! Per-process state of the engine.
//!
//! A [`ProcessContext`] owns the reserved descriptor table and the
//! diagnostics sink of one process. A forked child keeps its copy and calls
//! [`ProcessContext::after_fork`] before logging anything.

use std::fmt::Display;

use nix::unistd::Pid;

use crate::error::Result;
use crate::log::{Diagnostics, FdOutput, LogLevel, LogOptions, LogOutput};
use crate::servicefd::{ServiceFdError, ServiceFdTable};

pub struct ProcessContext<O: LogOutput = FdOutput> {
    fds: ServiceFdTable,
    log: Diagnostics<O>,
}

impl ProcessContext<FdOutput> {
    /// Reserves the descriptor band and opens the log output.
    pub fn new(opts: LogOptions) -> Result<Self> {
        Self::with_parts(ServiceFdTable::new()?, Diagnostics::new(opts))
    }
}

impl<O: LogOutput> ProcessContext<O> {
    pub fn with_parts(mut fds: ServiceFdTable, mut log: Diagnostics<O>) -> Result<Self> {
        log.init(&mut fds)?;
        Ok(Self { fds, log })
    }

    pub fn fds(&self) -> &ServiceFdTable {
        &self.fds
    }

    pub fn fds_mut(&mut self) -> &mut ServiceFdTable {
        &mut self.fds
    }

    pub fn log(&self) -> &Diagnostics<O> {
        &self.log
    }

    pub fn configure(&mut self, level: u32) {
        self.log.configure(level);
    }

    pub fn emit(&mut self, level: LogLevel, message: &str) {
        self.log.emit(&self.fds, level, message);
    }

    pub fn emit_fields(&mut self, level: LogLevel, message: &str, fields: &[(&str, &dyn Display)]) {
        self.log.emit_fields(&self.fds, level, message, fields);
    }

    pub fn error(&mut self, message: &str) {
        self.emit(LogLevel::Error, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn info(&mut self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    pub fn debug(&mut self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn msg(&mut self, message: &str) {
        self.emit(LogLevel::Msg, message);
    }

    /// Switches the diagnostics over to the identity of a new child.
    pub fn after_fork(&mut self, pid: Pid) {
        self.log.reinit_for_process(&mut self.fds, pid);
    }

    /// Releases every reserved descriptor.
    pub fn teardown(mut self) -> std::result::Result<(), ServiceFdError> {
        self.log.fini(&mut self.fds);
        self.fds.release_all()
    }
}
