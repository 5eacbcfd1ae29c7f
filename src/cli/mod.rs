mod feedback;
mod predict;
pub mod server;
mod show;
mod train;
mod tune;

pub use feedback::*;
pub use predict::*;
pub use server::*;
pub use show::*;
pub use train::*;
pub use tune::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
