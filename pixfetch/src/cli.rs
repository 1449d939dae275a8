// pixfetch/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use pixfetch_common::config::Config;
use pixfetch_common::error::Result;

pub mod get;
pub mod schemes;

use crate::cli::get::Get;
use crate::cli::schemes::Schemes;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "pixfetch", bin_name = "pixfetch")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one or more image URLs concurrently
    Get(Get),
    /// Print the URL schemes a fetch would accept
    Schemes(Schemes),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Get(command) => command.run(config).await,
            Self::Schemes(command) => command.run(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parses_get_with_options() {
        let args = CliArgs::parse_from([
            "pixfetch",
            "-vv",
            "get",
            "https://example.com/a.png",
            "data:,",
            "--cache-policy",
            "reload",
            "--scheme",
            "https",
            "--scheme",
            "data",
            "-H",
            "Authorization: Bearer t",
        ]);
        assert_eq!(args.verbose, 2);
        let Command::Get(get) = args.command else {
            panic!("expected get");
        };
        assert_eq!(get.urls.len(), 2);
        assert_eq!(
            get.cache_policy,
            Some(pixfetch_common::CachePolicy::ReloadIgnoringCache)
        );
        assert_eq!(get.schemes, ["https", "data"]);
        assert_eq!(get.headers, ["Authorization: Bearer t"]);
    }

    #[test]
    fn get_requires_a_url() {
        assert!(CliArgs::try_parse_from(["pixfetch", "get"]).is_err());
    }
}
