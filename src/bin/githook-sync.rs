//! Privileged helper, run through `sudo -n`.
//!
//! Trusts nothing from its caller: see [`githook_protect::gateway::helper`].

use std::path::PathBuf;

use clap::Parser;

use githook_protect::config::ProtectConfig;
use githook_protect::gateway::helper::{self, HelperRequest};
use githook_protect::identity::{Account, IdentityResolver};

#[derive(Parser)]
#[command(
    name = "githook-sync",
    about = "Mirror a staging directory into a working tree as the protection identity"
)]
struct Args {
    /// Staging directory created by the hook
    source: PathBuf,
    /// Root of the working tree to update
    destination: PathBuf,
    /// Repository-relative paths to mirror
    #[arg(required = true)]
    paths: Vec<String>,
}

fn main() {
    githook_protect::init_logging();

    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ProtectConfig::load_trusted()?;
    let owner = Account::lookup(&config.protection_user)?;
    let request = HelperRequest {
        source: args.source,
        destination: args.destination,
        paths: args.paths,
    };
    helper::serve(&request, &IdentityResolver::from_env(), &config, &owner)?;
    Ok(())
}
