//! Subcommand implementations.

pub mod init;
pub mod run;
pub mod status;

pub use init::InitArgs;
pub use run::RunArgs;
pub use status::StatusArgs;
