use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use dockspawn::{
    DockerClient, FileHub, LifecycleController, SandboxStatus, SpawnError, SpawnerConfig,
};

#[derive(Parser)]
#[command(name = "dockspawn")]
#[command(about = "Per-user sandbox containers on Docker", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "DOCKSPAWN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding per-sandbox state files
    #[arg(long, env = "DOCKSPAWN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Directory for log files (defaults to <state-dir>/logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// User the sandbox belongs to
    user: String,

    /// Named session; the default session when omitted
    #[arg(short, long, default_value = "")]
    session: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Make sure the sandbox is running and print its endpoint
    Up {
        #[command(flatten)]
        target: Target,

        /// Image to run, subject to allowed_images
        #[arg(short, long)]
        image: Option<String>,
    },

    /// Stop the sandbox, removing it if configured to
    Down {
        #[command(flatten)]
        target: Target,
    },

    /// Report whether the sandbox is ready
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// Print the object name a sandbox would get
    Name {
        #[command(flatten)]
        target: Target,

        #[arg(short, long)]
        image: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state_dir = cli.state_dir.unwrap_or_else(FileHub::default_state_dir);
    let log_dir = cli.log_dir.unwrap_or_else(|| state_dir.join("logs"));
    let _log_guards = dockspawn::shared::init_logging(&log_dir, "dockspawn")?;

    let config = Arc::new(SpawnerConfig::load(cli.config.as_deref())?);
    let hub = Arc::new(FileHub::new(&state_dir));

    if let Commands::Name { target, image } = &cli.command {
        let naming = config.naming();
        let identity = naming.identity(&target.user, &target.session);
        let image = image.as_deref().unwrap_or(&config.image);
        println!("{}", naming.object_name(&identity, image));
        return Ok(());
    }

    let client = Arc::new(DockerClient::connect(&config.docker).await?);
    let controller = LifecycleController::with_client(config.clone(), client, hub);

    match cli.command {
        Commands::Up { target, image } => {
            let identity = controller.identity(&target.user, &target.session);
            match controller.launch(&identity, image.as_deref()).await {
                Ok(endpoint) => println!("{endpoint}"),
                Err(e) => return Err(report(e)),
            }
        }
        Commands::Down { target } => {
            let identity = controller.identity(&target.user, &target.session);
            controller.ensure_stopped(&identity).await.map_err(report)?;
            println!("stopped");
        }
        Commands::Status { target } => {
            let identity = controller.identity(&target.user, &target.session);
            match controller.poll_status(&identity).await.map_err(report)? {
                SandboxStatus::Ready => println!("ready"),
                SandboxStatus::NotReady(reason) => println!("not ready: {reason}"),
                SandboxStatus::Absent => println!("absent"),
            }
        }
        Commands::Name { .. } => {}
    }

    Ok(())
}

fn report(err: SpawnError) -> anyhow::Error {
    anyhow::anyhow!(err.user_message())
}
