mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::Core;

#[derive(Parser)]
#[command(name = "ptx")]
#[command(about = "P2P trade settlement operator CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> environment -> overrides)
    #[arg(
        long = "config",
        global = true,
        default_value = "config/defaults/base.yaml"
    )]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Sale phase commands
    Phase {
        #[command(subcommand)]
        cmd: PhaseCmd,
    },

    /// Ledger reconciliation
    Reconcile {
        #[command(subcommand)]
        cmd: ReconcileCmd,
    },

    /// Custody account queries
    Custody {
        #[command(subcommand)]
        cmd: CustodyCmd,
    },

    /// Order maintenance
    Orders {
        #[command(subcommand)]
        cmd: OrdersCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply embedded SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum PhaseCmd {
    /// List phases and the active phase's supply
    Show,
    /// Close the active phase and open the next one by seq
    Advance,
}

#[derive(Subcommand)]
enum ReconcileCmd {
    /// Push reputation deltas for every counterpart with released orders
    Reputation {
        /// Compute deltas without submitting anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum CustodyCmd {
    /// Custody balance of one asset kind
    Balance {
        /// NATIVE | SECONDARY
        #[arg(long, default_value = "NATIVE")]
        asset: String,
    },
}

#[derive(Subcommand)]
enum OrdersCmd {
    /// Expire overdue orders that never reached escrow
    ExpireSweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ptx_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ptx_db::status(&pool).await?;
                    println!("db_ok={} has_orders_table={}", s.ok, s.has_orders_table);
                }
                DbCmd::Migrate => {
                    ptx_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = ptx_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Phase { cmd } => {
            let core = Core::connect(&cli.config_paths).await?;
            match cmd {
                PhaseCmd::Show => commands::settlement::phase_show(&core).await?,
                PhaseCmd::Advance => commands::settlement::phase_advance(&core).await?,
            }
        }

        Commands::Reconcile {
            cmd: ReconcileCmd::Reputation { dry_run },
        } => {
            let core = Core::connect(&cli.config_paths).await?;
            commands::reconcile::reputation(&core, dry_run).await?;
        }

        Commands::Custody {
            cmd: CustodyCmd::Balance { asset },
        } => {
            let asset = commands::parse_asset(&asset)?;
            let core = Core::connect(&cli.config_paths).await?;
            commands::settlement::custody_balance(&core, asset).await?;
        }

        Commands::Orders {
            cmd: OrdersCmd::ExpireSweep,
        } => {
            let core = Core::connect(&cli.config_paths).await?;
            commands::settlement::expire_sweep(&core).await?;
        }
    }

    Ok(())
}
