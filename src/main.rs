use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod be;

use be::lifecycle::Manager;
use be::mock::EmulatorStorage;
use be::zfs::ZfsStorage;
use be::{Error, Outcome, Storage, staging_dir};

#[derive(Parser)]
#[command(version, about = "Boot Environment Administration")]
struct Cli {
    /// Verbose output
    #[arg(short = 'v', global = true, help_heading = "Global options")]
    verbose: bool,

    /// Storage implementation
    #[arg(
        long = "client",
        global = true,
        help_heading = "Global options",
        default_value = "zfs"
    )]
    client: ClientType,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark a boot environment as the one to boot next.
    Activate {
        /// The boot environment to activate.
        be_name: String,
    },
    /// Show the boot environment the pool will boot next.
    Active,
    /// Create a new boot environment by cloning the running one.
    Create {
        /// A name for the new boot environment.
        be_name: String,
    },
    /// Show the boot environment the system is running.
    Current,
    /// Destroy an inactive boot environment.
    Destroy {
        /// The boot environment to destroy.
        be_name: String,
    },
    /// List boot environments.
    List {
        /// Omit headers and formatting, separate fields by a single tab.
        #[arg(short = 'H')]
        parseable: bool,
    },
    /// Mount a boot environment under /mnt.
    Mount {
        /// The boot environment to mount.
        ///
        /// The running boot environment is already mounted and cannot be
        /// staged.
        be_name: String,
    },
    /// Unmount a boot environment mounted under /mnt.
    Unmount {
        /// The boot environment.
        be_name: String,
    },
}

/// Storage selection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ClientType {
    /// Run the zfs, zpool and mount utilities.
    #[value(name = "zfs")]
    Zfs,
    /// Use an in-memory emulator (for testing).
    #[value(name = "mock")]
    Mock,
}

/// Prints boot environments in the traditional `beadm list` format.
fn print_boot_environments<S: Storage>(
    manager: &Manager<S>,
    mut writer: impl std::io::Write,
    parseable: bool,
) -> Result<(), Error> {
    let registry = manager.registry();
    let names = registry.list()?;
    let current = registry.current();
    // A pool without a usable bootfs still lists; nothing is flagged N.
    let active = match registry.active() {
        Ok(name) => Some(name),
        Err(err) => {
            tracing::warn!("{}", err);
            None
        }
    };

    let flags = |name: &str| {
        let mut flags = String::new();
        if active.as_deref() == Some(name) {
            flags.push('N');
        }
        if current == name {
            flags.push('R');
        }
        flags
    };

    if parseable {
        for name in &names {
            writeln!(writer, "{}\t{}", name, flags(name))?;
        }
        return Ok(());
    }

    let name_width = names.iter().map(String::len).fold(4, usize::max);
    writeln!(
        writer,
        "{:<name_width$}  {}",
        "NAME",
        "ACTIVE",
        name_width = name_width
    )?;
    for name in &names {
        let flags = flags(name);
        writeln!(
            writer,
            "{:<name_width$}  {}",
            name,
            if flags.is_empty() { "-" } else { flags.as_str() },
            name_width = name_width
        )?;
    }

    Ok(())
}

/// Turn a rejected outcome into an error, reporting whether anything
/// changed.
fn applied(outcome: Outcome) -> Result<bool> {
    match outcome {
        Outcome::Applied => Ok(true),
        Outcome::Unchanged => Ok(false),
        Outcome::Rejected(err) => Err(err.into()),
    }
}

fn execute_command<S: Storage>(command: &Commands, manager: &Manager<S>) -> Result<()> {
    match command {
        Commands::Activate { be_name } => {
            let outcome = manager
                .activate(be_name)
                .context("Failed to activate boot environment")?;
            if applied(outcome)? {
                println!("Activated '{}'.", be_name);
            }
            Ok(())
        }
        Commands::Active => {
            let name = manager
                .registry()
                .active()
                .context("Failed to determine the next boot environment")?;
            println!("{}", name);
            Ok(())
        }
        Commands::Create { be_name } => {
            let outcome = manager
                .create(be_name)
                .context("Failed to create boot environment")?;
            if applied(outcome)? {
                println!("Created boot environment '{}'.", be_name);
            }
            Ok(())
        }
        Commands::Current => {
            println!("{}", manager.context().current());
            Ok(())
        }
        Commands::Destroy { be_name } => {
            let outcome = manager
                .destroy(be_name)
                .context("Failed to destroy boot environment")?;
            if applied(outcome)? {
                println!("Destroyed '{}'.", be_name);
            }
            Ok(())
        }
        Commands::List { parseable } => {
            print_boot_environments(manager, std::io::stdout(), *parseable)
                .context("Failed to list boot environments")?;
            Ok(())
        }
        Commands::Mount { be_name } => {
            let outcome = manager
                .mount(be_name)
                .context("Failed to mount boot environment")?;
            // Already being mounted in place still tells the caller where.
            applied(outcome)?;
            println!(
                "Mounted '{}' at '{}'.",
                be_name,
                staging_dir(be_name).display()
            );
            Ok(())
        }
        Commands::Unmount { be_name } => {
            let outcome = manager
                .unmount(be_name)
                .context("Failed to unmount boot environment")?;
            if applied(outcome)? {
                println!("Unmounted '{}'.", be_name);
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(tracing_subscriber::fmt::format().with_ansi(false).compact())
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.client {
        ClientType::Mock => {
            let manager = Manager::open(EmulatorStorage::sampled())
                .context("Failed to open the emulated pool")?;
            execute_command(&cli.command, &manager)?;
        }
        ClientType::Zfs => {
            let manager = Manager::open(ZfsStorage::new())
                .context("Failed to determine the running boot environment")?;
            execute_command(&cli.command, &manager)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled() -> Manager<EmulatorStorage> {
        Manager::open(EmulatorStorage::sampled()).unwrap()
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_print_boot_environments_output() {
        let manager = sampled();
        let mut output = Vec::new();
        print_boot_environments(&manager, &mut output, false).unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            r"NAME     ACTIVE
alt      -
default  NR
"
        );
    }

    #[test]
    fn test_print_boot_environments_parseable() {
        let manager = sampled();
        let mut output = Vec::new();
        print_boot_environments(&manager, &mut output, true).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "alt\t\ndefault\tNR\n");
    }

    #[test]
    fn test_print_boot_environments_after_activate() {
        let manager = sampled();
        assert!(matches!(manager.activate("alt").unwrap(), Outcome::Applied));
        let mut output = Vec::new();
        print_boot_environments(&manager, &mut output, true).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "alt\tN\ndefault\tR\n");
    }

    #[test]
    fn test_print_boot_environments_without_bootfs() {
        let storage = EmulatorStorage::sampled().with_pool_property("zfake", "bootfs", "-");
        let manager = Manager::open(storage).unwrap();
        let mut output = Vec::new();
        print_boot_environments(&manager, &mut output, true).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "alt\t\ndefault\tR\n");
    }

    #[test]
    fn test_create_command() {
        let manager = sampled();
        let result = execute_command(
            &Commands::Create {
                be_name: "next".to_string(),
            },
            &manager,
        );
        assert!(result.is_ok());
        assert!(manager.registry().exists("next").unwrap());
    }

    #[test]
    fn test_create_command_conflict() {
        let manager = sampled();
        let result = execute_command(
            &Commands::Create {
                be_name: "alt".to_string(),
            },
            &manager,
        );
        let err = result.unwrap_err();
        let be_err = err.downcast_ref::<Error>().expect("Should be a be::Error");
        assert!(matches!(be_err, Error::Conflict { name } if name == "alt"));
    }

    #[test]
    fn test_destroy_command_current() {
        let manager = sampled();
        let err = execute_command(
            &Commands::Destroy {
                be_name: "default".to_string(),
            },
            &manager,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CannotDestroyCurrent { .. })
        ));
    }

    #[test]
    fn test_mount_command_not_found() {
        let manager = sampled();
        let result = execute_command(
            &Commands::Mount {
                be_name: "non-existent".to_string(),
            },
            &manager,
        );
        let err = result.unwrap_err();
        let be_err = err.downcast_ref::<Error>().expect("Should be a be::Error");
        assert!(matches!(be_err, Error::NotFound { name } if name == "non-existent"));
    }

    #[test]
    fn test_mount_and_unmount_commands() {
        let manager = sampled();
        let mount = Commands::Mount {
            be_name: "alt".to_string(),
        };
        assert!(execute_command(&mount, &manager).is_ok());
        // A second mount is not an error.
        assert!(execute_command(&mount, &manager).is_ok());

        let unmount = Commands::Unmount {
            be_name: "alt".to_string(),
        };
        assert!(execute_command(&unmount, &manager).is_ok());
        assert!(execute_command(&unmount, &manager).is_ok());
        assert!(
            !manager
                .storage()
                .directory_exists(std::path::Path::new("/mnt/alt"))
        );
    }

    #[test]
    fn test_activate_command() {
        let manager = sampled();
        let result = execute_command(
            &Commands::Activate {
                be_name: "alt".to_string(),
            },
            &manager,
        );
        assert!(result.is_ok());
        assert_eq!(manager.registry().active().unwrap(), "alt");
    }
}
