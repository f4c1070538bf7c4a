//! Seams to external collaborators invoked as opaque commands.

pub mod command;

pub use command::{env_bindings, CommandError, CommandOutput, CommandRunner, ShellRunner};

#[cfg(test)]
pub use command::MockCommandRunner;
