//! Configuration for the MCPU proxy: launch specs, the resolved server map,
//! and XDG path resolution.

mod launch;
pub mod paths;
mod view;

pub use launch::LaunchSpec;
pub use view::{ConfigHandle, ConfigView, is_valid_server_name};
