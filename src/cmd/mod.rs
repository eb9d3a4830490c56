//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `heal`   | `Heal`           |
//! | `config` | `Config`         |

pub mod config;
pub mod heal;
pub mod serve;

pub use config::cmd_config;
pub use heal::{HealArgs, cmd_heal};
pub use serve::cmd_serve;
