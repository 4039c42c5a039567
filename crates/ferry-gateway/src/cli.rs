use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ferry", version, about = "Ferry: trust-aware injection daemon")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Validate the config file.
    Check {
        /// Output format: human (default) or json
        #[arg(long, default_value = "human")]
        format: String,
    },
    /// Print the policy a source would get in a session, as JSON.
    Policy {
        /// Source type: cli, daemon, plugin, cron, api, p2p, p2p-discovery, gateway.
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        session: String,
        /// Source identity (user, plugin id, cron job or public key).
        #[arg(long)]
        identity: Option<String>,
    },
    /// Run one message through the full pipeline and print the outcome.
    Inject {
        #[arg(short, long, default_value = "main")]
        session: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        identity: Option<String>,
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        message: String,
    },
    /// Serve JSON-lines requests on stdin until it closes.
    Serve,
    Version,
}
