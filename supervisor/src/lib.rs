pub mod child;
pub mod error;
pub mod notification;
pub mod output_parser;
pub mod state_store;
pub mod supervisor;
pub mod watchdog;

pub use error::{Result, StoreError, SupervisorError};
pub use output_parser::{create_output_parser, OutputParser, ParsedOutput};
pub use state_store::{Registry, StateStore};
pub use supervisor::{Supervisor, SupervisorOptions};
