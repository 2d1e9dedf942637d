//! Platewise - command-line client
//!
//! Signs in against a Platewise server and keeps the session token in the
//! local data directory between runs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use platewise_app::{
    forward_updates, AuthController, AuthPhase, AuthSnapshot, RemoteBackend, SqliteTokenStore,
};
use platewise_core::config::project_dirs;
use platewise_core::ProfilePatch;
use platewise_net::{Client, DEFAULT_PORT};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "platewise")]
#[command(about = "Platewise account client")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(
        short,
        long,
        env = "PLATEWISE_SERVER",
        default_value_t = format!("127.0.0.1:{DEFAULT_PORT}")
    )]
    server: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Client database holding the session token
    #[arg(long, env = "PLATEWISE_CLIENT_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the stored session and show the current user
    Status,

    /// Create an account
    SignUp {
        email: String,
        name: String,
        #[arg(long, env = "PLATEWISE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Sign in and store the session token
    SignIn {
        email: String,
        #[arg(long, env = "PLATEWISE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Revoke the stored session
    SignOut,

    /// Change profile fields; omitted fields stay as they are
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        goal: Option<u32>,
    },

    /// Mark onboarding as done
    Onboard,

    /// Print the current user whenever it changes
    Watch,
}

fn client_db_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.db {
        Some(path) => Ok(path.clone()),
        None => Ok(project_dirs()?.data_dir().join("client.db")),
    }
}

fn print_snapshot(snapshot: &AuthSnapshot) {
    match (&snapshot.phase, &snapshot.user) {
        (AuthPhase::Authenticated, Some(user)) => {
            println!("Signed in as {} <{}>", user.name, user.email);
            println!("  onboarding completed: {}", user.onboarding_completed);
            match user.daily_calorie_goal {
                Some(goal) => println!("  daily calorie goal: {goal}"),
                None => println!("  daily calorie goal: not set"),
            }
        }
        _ => println!("Not signed in"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let store = SqliteTokenStore::open(client_db_path(&cli)?).context("opening client database")?;
    // Connects on first use, so sign-out clears local state even offline
    let backend = RemoteBackend::new(cli.server.clone(), Duration::from_secs(cli.timeout));
    let controller = AuthController::new(backend, store);

    match cli.command {
        Commands::SignUp {
            email,
            name,
            password,
        } => {
            let client = connected(&controller, &cli.server).await?;
            let user = client.sign_up(&email, &name, &password).await?;
            println!("Created account for {} <{}>", user.name, user.email);
        }
        Commands::SignIn { email, password } => {
            let client = connected(&controller, &cli.server).await?;
            let session = client.sign_in(&email, &password).await?;
            controller.sign_in(session.token).await?;
            print_snapshot(&controller.snapshot());
        }
        Commands::Status => {
            controller.boot().await?;
            print_snapshot(&controller.snapshot());
        }
        Commands::SignOut => {
            controller.sign_out().await;
            println!("Signed out");
        }
        Commands::Profile { name, goal } => {
            let patch = ProfilePatch {
                name,
                daily_calorie_goal: goal,
            };
            if patch.is_empty() {
                bail!("nothing to change; pass --name or --goal");
            }
            require_session(&controller).await?;
            controller.update_profile(patch).await?;
            print_snapshot(&controller.snapshot());
        }
        Commands::Onboard => {
            require_session(&controller).await?;
            controller.complete_onboarding().await?;
            print_snapshot(&controller.snapshot());
        }
        Commands::Watch => {
            require_session(&controller).await?;
            controller.watch().await?;
            print_snapshot(&controller.snapshot());

            let client = connected(&controller, &cli.server).await?;
            let mut changes = controller.subscribe();
            let printer = async {
                while changes.changed().await {
                    print_snapshot(&changes.snapshot());
                }
            };
            tokio::select! {
                _ = forward_updates(client, &controller) => {}
                _ = printer => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    Ok(())
}

type Controller = AuthController<RemoteBackend, SqliteTokenStore>;

async fn connected<'a>(controller: &'a Controller, server: &str) -> Result<&'a Client> {
    controller
        .backend()
        .client()
        .await
        .with_context(|| format!("connecting to {server}"))
}

async fn require_session(controller: &Controller) -> Result<()> {
    controller.boot().await?;
    if controller.phase() != AuthPhase::Authenticated {
        bail!("not signed in");
    }
    Ok(())
}
