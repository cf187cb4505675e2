use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use pi_messenger::dispatch::Dispatcher;
use pi_messenger::output::{Format, print_response};

#[derive(Parser)]
#[command(
    name = "pi-messenger",
    version,
    about = "File-based coordination for coding agents sharing one workstation"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a raw action record (JSON with an `action` field)
    Act {
        /// The action record, e.g. '{"action":"send","to":"swift-otter","message":"hi"}'
        record: String,
    },
    /// Join the mesh (name from $PI_AGENT_NAME or generated)
    Join {
        /// Working spec path to attach
        #[arg(long)]
        spec: Option<String>,
    },
    /// Leave the mesh, cleaning up inbox and claims
    Leave,
    /// Own status and peer count
    Status,
    /// List active agents
    List,
    /// Recent activity feed events
    Feed {
        /// Most recent N events
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// One agent's details
    Whois {
        name: String,
    },
    /// Send a message to one or more agents (comma-separated)
    Send {
        to: String,
        message: String,
        /// Message id this replies to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Send a message to every active peer
    Broadcast {
        message: String,
    },
    /// Reserve paths against concurrent edits (comma-separated)
    Reserve {
        paths: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release reservations (all of them when no paths given)
    Release {
        paths: Option<String>,
    },
    /// Claims and completions for the working spec
    Swarm {
        #[arg(long)]
        spec: Option<String>,
    },
    /// Claim a task from the working spec
    Claim {
        task_id: String,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release a claim
    Unclaim {
        task_id: String,
        #[arg(long)]
        spec: Option<String>,
    },
    /// Complete a claimed task
    Complete {
        task_id: String,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let dispatcher = Dispatcher::new(cwd, "cli");

    let record = match cli.command {
        Commands::Act { record } => match serde_json::from_str::<Value>(&record) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("Error: invalid action record: {err}");
                std::process::exit(2);
            }
        },
        Commands::Join { spec } => action("join", |v| {
            maybe(v, "spec", spec);
        }),
        Commands::Leave => json!({ "action": "leave" }),
        Commands::Status => json!({ "action": "status" }),
        Commands::List => json!({ "action": "list" }),
        Commands::Feed { limit } => json!({ "action": "feed", "limit": limit }),
        Commands::Whois { name } => json!({ "action": "whois", "name": name }),
        Commands::Send {
            to,
            message,
            reply_to,
        } => action("send", |v| {
            v["to"] = json!(to);
            v["message"] = json!(message);
            maybe(v, "replyTo", reply_to);
        }),
        Commands::Broadcast { message } => json!({ "action": "broadcast", "message": message }),
        Commands::Reserve { paths, reason } => action("reserve", |v| {
            v["paths"] = json!(paths);
            maybe(v, "reason", reason);
        }),
        Commands::Release { paths } => action("release", |v| {
            maybe(v, "paths", paths);
        }),
        Commands::Swarm { spec } => action("swarm", |v| {
            maybe(v, "spec", spec);
        }),
        Commands::Claim {
            task_id,
            spec,
            reason,
        } => action("claim", |v| {
            v["taskId"] = json!(task_id);
            maybe(v, "spec", spec);
            maybe(v, "reason", reason);
        }),
        Commands::Unclaim { task_id, spec } => action("unclaim", |v| {
            v["taskId"] = json!(task_id);
            maybe(v, "spec", spec);
        }),
        Commands::Complete {
            task_id,
            spec,
            notes,
        } => action("complete", |v| {
            v["taskId"] = json!(task_id);
            maybe(v, "spec", spec);
            maybe(v, "notes", notes);
        }),
    };

    let response = dispatcher.dispatch(&record);
    let failed = response.is_error();
    print_response(&response, cli.format);
    if failed {
        std::process::exit(1);
    }
}

fn action(name: &str, fill: impl FnOnce(&mut Value)) -> Value {
    let mut value = json!({ "action": name });
    fill(&mut value);
    value
}

fn maybe(value: &mut Value, key: &str, field: Option<String>) {
    if let Some(field) = field {
        value[key] = json!(field);
    }
}
