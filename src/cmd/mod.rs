//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `run`    | `Run`            |
//! | `show`   | `Show`           |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod serve;
pub mod show;

pub use config::cmd_config;
pub use run::{RunArgs, cmd_run};
pub use serve::{ServeArgs, cmd_serve};
pub use show::cmd_show;
