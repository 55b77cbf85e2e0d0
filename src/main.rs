use std::os::unix::fs::MetadataExt;
use std::path::Path;

use clap::{Parser, Subcommand};

use githook_protect::config::{Elevation, ProtectConfig};
use githook_protect::exec::{CommandRunner, CommandSpec, SystemRunner};
use githook_protect::gateway::{Elevator, InProcess, SudoHelper};
use githook_protect::git::GitCli;
use githook_protect::hooks::HookInvocation;
use githook_protect::identity::{Account, IdentityResolver, Mode};
use githook_protect::patterns::PatternSet;
use githook_protect::protect::{ProtectOutcome, ProtectionOrchestrator};
use githook_protect::sparse::SparseCheckoutManager;
use githook_protect::workflow::{WorkflowConfigLoader, WorkflowDirectory};

#[derive(Parser)]
#[command(
    name = "githook",
    about = "Keep protected paths of a git working tree pinned to HEAD"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the actions for a git hook firing (always exits 0)
    Hook {
        /// Hook name, e.g. post-checkout
        name: String,
        /// Arguments git passed to the hook
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Protect the repository containing the current directory
    Protect,

    /// Check dependencies and installation
    Doctor,
}

fn main() {
    githook_protect::init_logging();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Hook { name, args } => {
            cmd_hook(&name, args);
            Ok(())
        }
        Commands::Protect => cmd_protect(),
        Commands::Doctor => cmd_doctor(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Never fails: whatever happens, the git operation that fired the hook
/// must succeed.
fn cmd_hook(name: &str, args: Vec<String>) {
    let invocation = match HookInvocation::parse(name, args) {
        Ok(invocation) => invocation,
        Err(e) => {
            log::debug!("{e}");
            return;
        }
    };
    let actions = invocation.actions();
    log::debug!("{}: {:?}", invocation.kind, actions);

    let git = GitCli::new();
    let root = match std::env::current_dir()
        .map_err(Into::into)
        .and_then(|cwd| git.show_toplevel(&cwd))
    {
        Ok(root) => root,
        Err(e) => {
            log::error!("{}: cannot locate repository: {}", invocation.kind, e);
            return;
        }
    };
    let patterns = match WorkflowDirectory::new(&root).load() {
        Ok(patterns) => patterns,
        Err(e) => {
            log::error!("{}: cannot load workflow patterns: {}", invocation.kind, e);
            return;
        }
    };

    if actions.sparse_checkout {
        let applied: Result<_, Box<dyn std::error::Error>> = patterns
            .assignment
            .map_err(Into::into)
            .and_then(|assignment| {
                SparseCheckoutManager::new(git.clone(), &root)
                    .apply(&assignment)
                    .map_err(Into::into)
            });
        if let Err(e) = applied {
            log::error!("{}: sparse checkout: {}", invocation.kind, e);
        }
    }
    if actions.protect {
        let protected: Result<_, Box<dyn std::error::Error>> = patterns
            .protected
            .map_err(Into::into)
            .and_then(|protected| protect(git, &root, &protected));
        if let Err(e) = protected {
            log::error!("{}: protection: {}", invocation.kind, e);
        }
    }
}

fn cmd_protect() -> Result<(), Box<dyn std::error::Error>> {
    let git = GitCli::new();
    let root = git.show_toplevel(&std::env::current_dir()?)?;
    let protected = WorkflowDirectory::new(&root).load()?.protected?;
    match protect(git, &root, &protected)? {
        ProtectOutcome::NoPatterns => println!("No protected path patterns configured"),
        ProtectOutcome::NoMatches => println!("No paths match the protected patterns"),
        ProtectOutcome::Protected { paths, flagged } => {
            println!("Protected {} path(s), {} file(s) flagged", paths.len(), flagged);
            for path in paths {
                println!("  {}", path);
            }
        }
    }
    Ok(())
}

fn protect(
    git: GitCli,
    root: &Path,
    patterns: &PatternSet,
) -> Result<ProtectOutcome, Box<dyn std::error::Error>> {
    let config = ProtectConfig::load()?;
    let real_user = IdentityResolver::from_env().real_user(Mode::Fallback)?;
    let elevator: Box<dyn Elevator> = match config.elevation {
        Elevation::Sudo => Box::new(SudoHelper::new(&config.sudo_path, &config.helper_path)),
        Elevation::Direct => Box::new(InProcess::new(Some(Account::lookup(
            &config.protection_user,
        )?))),
    };
    let orchestrator = ProtectionOrchestrator::from_config(&config, git, real_user, elevator);
    orchestrator.run(root, patterns).map_err(|e| {
        log::error!("protection stopped after the {} phase", e.phase());
        e.into()
    })
}

fn cmd_doctor() -> Result<(), Box<dyn std::error::Error>> {
    println!("githook-protect System Check\n");

    let config_path = ProtectConfig::default_path();
    let config = ProtectConfig::load_from(&config_path);
    println!(
        "[{}] config: {}",
        if config.is_ok() { "OK" } else { "FAIL" },
        match &config {
            Ok(_) if config_path.exists() => config_path.display().to_string(),
            Ok(_) => format!("{} (not found, using defaults)", config_path.display()),
            Err(e) => e.to_string(),
        }
    );
    let config = config.unwrap_or_default();

    let git = GitCli::new().version();
    println!(
        "[{}] git: {}",
        if git.is_ok() { "OK" } else { "FAIL" },
        match &git {
            Ok(version) => version.clone(),
            Err(_) => "not found".to_string(),
        }
    );

    let protection = Account::lookup(&config.protection_user);
    let protection_ok = matches!(&protection, Ok(account) if !account.is_superuser());
    println!(
        "[{}] protection user: {}",
        if protection_ok { "OK" } else { "FAIL" },
        match &protection {
            Ok(account) => format!("{} (uid {})", account.name, account.uid),
            Err(e) => e.to_string(),
        }
    );

    let mut helper_ok = true;
    if config.elevation == Elevation::Sudo {
        let sudo_ok = SystemRunner
            .run(&CommandSpec::new(&config.sudo_path).arg("-V"))
            .map(|o| o.success)
            .unwrap_or(false);
        println!(
            "[{}] sudo: {}",
            if sudo_ok { "OK" } else { "FAIL" },
            if sudo_ok { "available" } else { "not found" }
        );

        let helper = helper_status(&config.helper_path);
        println!(
            "[{}] helper: {} ({})",
            if helper.is_ok() { "OK" } else { "FAIL" },
            config.helper_path.display(),
            helper.as_ref().err().map(String::as_str).unwrap_or("root-owned, not writable")
        );
        helper_ok = sudo_ok && helper.is_ok();
    } else {
        println!("[INFO] elevation: direct (helper not used)");
    }

    if git.is_err() || !protection_ok || !helper_ok {
        std::process::exit(1);
    }

    Ok(())
}

fn helper_status(path: &Path) -> Result<(), String> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.uid() != 0 {
        return Err(format!("owned by uid {}, expected root", meta.uid()));
    }
    if meta.mode() & 0o022 != 0 {
        return Err("writable by group or others".to_string());
    }
    if meta.mode() & 0o111 == 0 {
        return Err("not executable".to_string());
    }
    Ok(())
}
