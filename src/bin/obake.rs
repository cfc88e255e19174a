use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use obake::logging::{self, LogLevel};

mod workflows;

#[derive(Parser, Debug)]
#[command(name = "obake", version, about = "Build and run minimal audio daemon images")]
struct Cli {
    /// Process-wide log level
    #[arg(long, value_enum, global = true, env = "OBAKE_LOG_LEVEL", default_value_t = LogLevel::Info, ignore_case = true)]
    log_level: LogLevel,

    /// Host config file (overrides OBAKE_CONFIG_FILE and the default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Shape recipes and builds
    Shape {
        #[command(subcommand)]
        action: ShapeCommands,
    },
    /// Published runtime images
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },
    /// Audio interfaces from the host config
    Interface {
        #[command(subcommand)]
        action: InterfaceCommands,
    },
    /// systemd user units
    Unit {
        #[command(subcommand)]
        action: UnitCommands,
    },
    /// Setups: an interface plus shape instances
    Setup {
        #[command(subcommand)]
        action: SetupCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ShapeCommands {
    /// List shape recipes
    List,
    /// Show one recipe
    Show { name: String },
    /// Print what a build would do, without running anything
    Plan { name: String },
    /// Build shapes into runtime images
    Build {
        names: Vec<String>,
        /// Build every shape
        #[arg(long, conflicts_with = "names")]
        all: bool,
        /// Shapes built in parallel
        #[arg(long, short, default_value_t = 1)]
        jobs: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ImageCommands {
    /// List published images
    List,
    /// Check an image against its manifest and archive
    Verify { name: String },
    /// Remove a published image and its archive
    Remove { name: String },
    /// Drop archives no image refers to
    Gc,
}

#[derive(Subcommand, Debug)]
enum InterfaceCommands {
    /// List configured interfaces
    List,
    /// Show one interface and its unit
    Show { name: String },
}

#[derive(Subcommand, Debug)]
enum UnitCommands {
    /// Start a unit in the user session
    Start { name: String },
    /// Stop a unit in the user session
    Stop { name: String },
}

#[derive(Subcommand, Debug)]
enum SetupCommands {
    /// List configured setups
    List,
    /// Show a setup's interface and instances
    Show { setup: String },
    /// Start the interface unit, then every instance unit
    Start { setup: String },
    /// Stop every instance unit, then the interface unit
    Stop { setup: String },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.log_level) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
    tracing::info!("Starting {} version {}", env!("CARGO_PKG_NAME"), obake::VERSION);
    tracing::debug!(?cli, "parsed command line");

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Shape { action } => match action {
            ShapeCommands::List => workflows::shape_list(config),
            ShapeCommands::Show { name } => workflows::shape_show(config, &name),
            ShapeCommands::Plan { name } => workflows::shape_plan(config, &name),
            ShapeCommands::Build { names, all, jobs } => {
                workflows::shape_build(config, &names, all, jobs)
            }
        },
        Commands::Image { action } => match action {
            ImageCommands::List => workflows::image_list(config),
            ImageCommands::Verify { name } => workflows::image_verify(config, &name),
            ImageCommands::Remove { name } => workflows::image_remove(config, &name),
            ImageCommands::Gc => workflows::image_gc(config),
        },
        Commands::Interface { action } => match action {
            InterfaceCommands::List => workflows::interface_list(config),
            InterfaceCommands::Show { name } => workflows::interface_show(config, &name),
        },
        Commands::Unit { action } => match action {
            UnitCommands::Start { name } => workflows::unit_start(&name),
            UnitCommands::Stop { name } => workflows::unit_stop(&name),
        },
        Commands::Setup { action } => match action {
            SetupCommands::List => workflows::setup_list(config),
            SetupCommands::Show { setup } => workflows::setup_show(config, &setup),
            SetupCommands::Start { setup } => workflows::setup_start(config, &setup),
            SetupCommands::Stop { setup } => workflows::setup_stop(config, &setup),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn missing_help(cmd: &clap::Command, path: &str, out: &mut Vec<String>) {
        for sub in cmd.get_subcommands() {
            let name = format!("{path} {}", sub.get_name());
            if sub.get_about().is_none() {
                out.push(name.clone());
            }
            missing_help(sub, &name, out);
        }
    }

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_every_subcommand_has_help() {
        let mut missing = Vec::new();
        missing_help(&Cli::command(), "obake", &mut missing);
        assert!(missing.is_empty(), "no help text: {missing:?}");
    }

    #[test]
    fn test_setup_start_parses() {
        let cli = Cli::try_parse_from(["obake", "setup", "start", "studio"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Setup { action: SetupCommands::Start { ref setup } } if setup == "studio"
        ));
    }
}
