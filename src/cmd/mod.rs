//! CLI command implementations.
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `serve`  | `Serve`            |
//! | `store`  | `Init`, `Status`   |
//! | `config` | `Config`           |

pub mod config;
pub mod serve;
pub mod store;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use store::{cmd_init, cmd_status};
