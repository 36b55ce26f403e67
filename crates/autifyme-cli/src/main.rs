//! AutifyME CLI: operate workflows, approvals, audit and cost data.
//!
//! Workflows are driven by the definition-walking executor, which makes the
//! CLI a dry-run and operator tool over the same SQLite database a
//! production embedding would use.

use autifyme_cli::commands;
use clap::{Parser, Subcommand};

/// AutifyME workflow orchestration engine
#[derive(Parser)]
#[command(name = "autifyme", version, about = "AutifyME workflow orchestration engine")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "AUTIFYME_DB_PATH", global = true)]
    db: Option<String>,

    /// Engine configuration YAML (providers, budget, retry, ...)
    #[arg(long, env = "AUTIFYME_CONFIG", global = true)]
    config: Option<String>,

    /// Directory of additional workflow definition YAML files
    #[arg(long, env = "AUTIFYME_DEFINITIONS", global = true)]
    definitions: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start, drive and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Inspect approval requests
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Query the audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Spend and budget per business
    Cost {
        #[command(subcommand)]
        action: CostAction,
    },

    /// Provider table and routing
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Create a workflow and position it at its first step
    Start {
        /// Workflow type (see `workflow types`)
        #[arg(long = "type")]
        workflow_type: String,
        /// Owning business (tenant) ID
        #[arg(long)]
        business: String,
        /// Initial data as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
    /// Run the current step
    Advance {
        /// Workflow ID
        id: String,
        /// Keep advancing until the workflow pauses, ends or waits on a retry
        #[arg(long)]
        all: bool,
    },
    /// Approve or reject the pending approval of a paused workflow
    Resume {
        /// Workflow ID
        id: String,
        /// Reject with this reason instead of approving
        #[arg(long)]
        reject: Option<String>,
        /// Approver identity
        #[arg(long = "by")]
        approver: String,
    },
    /// Cancel a workflow
    Cancel {
        /// Workflow ID
        id: String,
        #[arg(long = "by", default_value = "cli")]
        actor: String,
    },
    /// Show a workflow and its pending approval
    Get {
        /// Workflow ID
        id: String,
    },
    /// List a business's workflows, newest first
    List {
        #[arg(long)]
        business: String,
        /// PENDING, RUNNING, PAUSED_FOR_APPROVAL, FAILED, COMPLETED or CANCELLED
        #[arg(long)]
        status: Option<String>,
    },
    /// List registered workflow types
    Types,
    /// Validate a workflow definition YAML file
    Validate {
        /// Path to the definition file
        file: String,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// Pending approvals of a business, or every request of one workflow
    List {
        #[arg(long)]
        business: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Entries for a business in timestamp order
    Query {
        #[arg(long)]
        business: String,
        #[arg(long)]
        workflow: Option<String>,
        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound (inclusive)
        #[arg(long)]
        until: Option<String>,
    },
}

#[derive(Subcommand)]
enum CostAction {
    /// Total, window spend and per-provider breakdown
    Summary {
        #[arg(long)]
        business: String,
    },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Configured providers with their circuit state
    List,
    /// Show which provider a tier and capability set resolves to
    Resolve {
        /// FAST, BALANCED or PREMIUM
        #[arg(long)]
        tier: String,
        /// Required capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autifyme_core=warn,autifyme_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let result = match command {
        Commands::Workflow {
            action: WorkflowAction::Validate { file },
        } => commands::workflow::validate(&file),
        command => {
            let db = cli.db.unwrap_or_else(commands::default_db_path);
            match commands::init(&db, cli.config.as_deref(), cli.definitions.as_deref()) {
                Ok(ctx) => run(&ctx, command).await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(value) => commands::print_json(&value),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(ctx: &commands::AppContext, command: Commands) -> Result<serde_json::Value, String> {
    match command {
        Commands::Workflow { action } => match action {
            WorkflowAction::Start {
                workflow_type,
                business,
                data,
            } => commands::workflow::start(ctx, &business, &workflow_type, data.as_deref()).await,
            WorkflowAction::Advance { id, all } => commands::workflow::advance(ctx, &id, all).await,
            WorkflowAction::Resume {
                id,
                reject,
                approver,
            } => commands::workflow::resume(ctx, &id, reject.as_deref(), &approver).await,
            WorkflowAction::Cancel { id, actor } => commands::workflow::cancel(ctx, &id, &actor).await,
            WorkflowAction::Get { id } => commands::workflow::get(ctx, &id).await,
            WorkflowAction::List { business, status } => {
                commands::workflow::list(ctx, &business, status.as_deref()).await
            }
            WorkflowAction::Types => commands::workflow::types(ctx),
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
        },

        Commands::Approval {
            action: ApprovalAction::List { business, workflow },
        } => commands::approval::list(ctx, business.as_deref(), workflow.as_deref()).await,

        Commands::Audit {
            action:
                AuditAction::Query {
                    business,
                    workflow,
                    since,
                    until,
                },
        } => {
            commands::audit::query(
                ctx,
                &business,
                workflow.as_deref(),
                since.as_deref(),
                until.as_deref(),
            )
            .await
        }

        Commands::Cost {
            action: CostAction::Summary { business },
        } => commands::cost::summary(ctx, &business).await,

        Commands::Provider { action } => match action {
            ProviderAction::List => commands::provider::list(ctx),
            ProviderAction::Resolve { tier, capabilities } => {
                commands::provider::resolve(ctx, &tier, &capabilities)
            }
        },
    }
}
