pub(crate) mod command;
pub(crate) mod probe;
pub(crate) mod send;
pub(crate) mod stream;

pub use self::command::{Args, Command, LogLevel, OutputFormat, SendArgs, StreamArgs};
