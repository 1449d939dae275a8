use clap::Args;
use colored::Colorize;
use pixfetch_common::config::Config;
use pixfetch_common::error::Result;

#[derive(Args, Debug)]
pub struct Schemes {
    /// Print the schemes on one line, comma separated
    #[arg(long)]
    pub plain: bool,
}

impl Schemes {
    pub fn run(&self, config: &Config) -> Result<()> {
        let schemes: Vec<&str> = config.supported_schemes.iter().map(String::as_str).collect();
        if self.plain {
            println!("{}", schemes.join(","));
            return Ok(());
        }
        println!(
            "{}{}",
            "==> ".bold().blue(),
            "Supported schemes".bold()
        );
        for scheme in schemes {
            println!("  {scheme}");
        }
        println!(
            "{} {}",
            "Default cache policy:".bold(),
            config.default_cache_policy
        );
        Ok(())
    }
}
