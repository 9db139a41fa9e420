mod add;
mod clean;
mod ingest;
mod locations;
mod r#match;
mod observe;
mod rebuild;
mod search;
mod show;

pub use add::*;
pub use clean::*;
pub use ingest::*;
pub use locations::*;
pub use r#match::*;
pub use observe::*;
pub use rebuild::*;
pub use search::*;
pub use show::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
