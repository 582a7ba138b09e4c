//! Shared types for the MCPU proxy: the universal result shape, the error
//! kinds, and the execution options every entry point funnels into.

pub mod error;
pub mod types;

pub use error::CoreError;
pub use types::{
    CoreExecutionOptions, CoreResult, EXIT_ERROR, EXIT_SUCCESS, EXIT_TIMEOUT, EXIT_VALIDATION,
    ResponseMode,
};
