use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Reset SIGPIPE to default behavior so piping (e.g. `atlas audit recent | head`) exits
/// cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use atlas_registry::cloning::CloneRequest;
use atlas_registry::config::{loader, Settings};
use atlas_registry::governance::Content;
use atlas_registry::output::formatter;
use atlas_registry::registry::Registry;
use atlas_registry::state::kinds::*;
use atlas_registry::state::models::*;

/// atlas - governed model registry
#[derive(Parser)]
#[command(name = "atlas", version, about, long_about = None)]
struct Cli {
    /// Path to an atlas.yaml settings file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the registry (.atlas database and asset tree)
    #[arg(short, long, default_value = ".")]
    working_dir: String,

    /// Acting user id
    #[arg(short, long, default_value = "admin")]
    user: String,

    /// Role of the acting user
    #[arg(short, long, default_value = "admin")]
    role: Role,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the registry database and asset root
    Init,

    /// Manage environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },

    /// Manage file blueprints
    Blueprint {
        #[command(subcommand)]
        command: BlueprintCommands,
    },

    /// Register and inspect file versions
    File {
        #[command(subcommand)]
        command: FileCommands,
    },

    /// Sign off, reject or revoke a file version
    Signoff {
        /// File reference (e.g. models:12)
        file: FileRef,

        /// sign_off, reject or revoke
        #[arg(short, long, default_value = "sign_off")]
        action: SignOffAction,

        /// Doer, Reviewer, Owner or Admin
        #[arg(short = 'C', long, default_value = "Doer")]
        capacity: Capacity,

        /// Mandatory comment
        #[arg(short = 'm', long)]
        comment: String,
    },

    /// Query the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Show file lineage
    Lineage {
        #[command(subcommand)]
        command: LineageCommands,
    },

    /// Manage an environment's project plan
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },

    /// Manage action items
    Action {
        #[command(subcommand)]
        command: ActionCommands,
    },

    /// Cross-check the database against the asset tree
    Health,

    /// System-wide counts
    Kpis,
}

#[derive(Subcommand)]
enum EnvCommands {
    /// Create an environment and its folder tree
    Create {
        id: String,
        name: String,
        #[arg(long, default_value = "Development")]
        category: Category,
        /// Roles allowed in: "all" or a comma-separated list
        #[arg(long, default_value = "all")]
        roles: RoleSet,
        #[arg(long)]
        purpose: Option<String>,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },

    /// List environments visible to the acting role
    List,

    /// Show an environment with its quick stats
    Show { id: String },

    /// Deep-copy an environment
    Clone {
        source: String,
        id: String,
        name: String,
        #[arg(long, default_value = "latest_approved")]
        profile: VersioningProfile,
        #[arg(long, default_value = "Development")]
        category: Category,
        /// Stages to copy (repeatable); all when omitted
        #[arg(long = "stage")]
        stages: Vec<Stage>,
        /// Also copy the project plan of this environment
        #[arg(long)]
        plan_from: Option<String>,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },

    /// Latest-approved snapshot into a locked Reporting environment
    Promote {
        source: String,
        id: String,
        name: String,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },

    /// Change an environment's status
    Status {
        id: String,
        status: EnvStatus,
        #[arg(short = 'm', long)]
        comment: String,
    },

    /// Edit name, purpose, allowed roles or status
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
        /// Roles allowed in: "all" or a comma-separated list
        #[arg(long)]
        roles: Option<RoleSet>,
        #[arg(long)]
        status: Option<EnvStatus>,
        #[arg(short = 'm', long)]
        comment: String,
    },

    /// Delete the files of an archived environment
    Prune {
        id: String,
        #[arg(short = 'm', long)]
        comment: String,
    },

    /// Print quick stats as JSON
    Stats { id: String },
}

#[derive(Subcommand)]
enum BlueprintCommands {
    /// Create a blueprint
    Create {
        id: String,
        name: String,
        #[arg(long)]
        stage: Stage,
        /// Expected extension, e.g. .csv
        #[arg(long)]
        ext: String,
        #[arg(long, default_value = "doer_and_reviewer")]
        workflow: Workflow,
        #[arg(long, default_value = "admin")]
        doers: RoleSet,
        #[arg(long, default_value = "admin")]
        reviewers: RoleSet,
        #[arg(long)]
        min_kb: Option<f64>,
        #[arg(long)]
        max_kb: Option<f64>,
        /// Expected structure as JSON: {"columns": [...], "tabs": [...]}
        #[arg(long)]
        structure: Option<String>,
        #[arg(long)]
        primary_key: Option<String>,
        #[arg(long)]
        source_type: Option<SourceType>,
        /// Approved domain key for external connections
        #[arg(long)]
        source_name: Option<String>,
        #[arg(long)]
        source_specifier: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
        #[arg(long)]
        owner_team: Option<String>,
    },

    /// List blueprints
    List {
        #[arg(long)]
        stage: Option<Stage>,
    },

    /// Show a blueprint
    Show { id: String },

    /// Stop accepting new versions
    Archive { id: String },

    /// Delete a blueprint no file uses
    Delete { id: String },
}

#[derive(Subcommand)]
enum FileCommands {
    /// Register a new version from a local file
    Add {
        env: String,
        blueprint: String,
        path: PathBuf,
        /// Parent file reference (repeatable)
        #[arg(long = "parent")]
        parents: Vec<FileRef>,
        /// Structure of the file as JSON: {"columns": [...], "tabs": [...]}
        #[arg(long)]
        structure: Option<String>,
    },

    /// List files in an environment with their governance status
    List {
        env: String,
        #[arg(long)]
        stage: Option<Stage>,
    },

    /// Show one file with its audit trail
    Status { file: FileRef },

    /// Files waiting on the acting user
    Inbox {
        env: String,
        #[arg(long)]
        stage: Stage,
    },

    /// Download an external connection blueprint into an environment
    Fetch {
        env: String,
        blueprint: String,
        #[arg(long = "parent")]
        parents: Vec<FileRef>,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Entries for one target (e.g. models:12, environments:dev)
    Target { target: Target },
    /// Entries written by one user
    Actor {
        actor: String,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Most recent entries
    Recent {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum LineageCommands {
    /// Parents of a file
    Up { file: FileRef },
    /// Children of a file
    Down { file: FileRef },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Add a milestone
    Add {
        env: String,
        title: String,
        #[arg(short, long, default_value = "1")]
        duration: i64,
        /// Due date (YYYY-MM-DD); only for tasks with no successors
        #[arg(long)]
        due: Option<NaiveDate>,
        #[arg(short, long)]
        owner: String,
        /// Predecessor milestone id (repeatable)
        #[arg(long = "after")]
        after: Vec<i64>,
    },
    /// Make TASK depend on PREDECESSOR
    Depend { task: i64, predecessor: i64 },
    /// Remove a dependency
    Undepend { task: i64, predecessor: i64 },
    /// Mark a milestone complete
    Complete { id: i64 },
    /// Mark a milestone pending again
    Reopen { id: i64 },
    /// Delete a milestone and its edges
    Remove { id: i64 },
    /// List milestones
    List { env: String },
    /// Compute the backward schedule and critical path
    Schedule { env: String },
}

#[derive(Subcommand)]
enum ActionCommands {
    /// Open an action item
    Add {
        env: String,
        description: String,
        #[arg(short, long)]
        owner: String,
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Close an action item
    Close {
        id: i64,
        #[arg(short = 'm', long)]
        comment: String,
    },
    /// List action items
    List {
        env: String,
        /// Only open items
        #[arg(long)]
        open: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli).await,
        Commands::Env { ref command } => cmd_env(&cli, command).await,
        Commands::Blueprint { ref command } => cmd_blueprint(&cli, command).await,
        Commands::File { ref command } => cmd_file(&cli, command).await,
        Commands::Signoff {
            file,
            action,
            capacity,
            ref comment,
        } => cmd_signoff(&cli, file, action, capacity, comment).await,
        Commands::Audit { ref command } => cmd_audit(&cli, command).await,
        Commands::Lineage { ref command } => cmd_lineage(&cli, command).await,
        Commands::Plan { ref command } => cmd_plan(&cli, command).await,
        Commands::Action { ref command } => cmd_action(&cli, command).await,
        Commands::Health => cmd_health(&cli).await,
        Commands::Kpis => cmd_kpis(&cli).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn load_settings(cli: &Cli) -> Result<Settings> {
    let working_dir = Path::new(&cli.working_dir);
    loader::load_settings(cli.config.as_deref().map(Path::new), working_dir)
}

async fn open_registry(cli: &Cli) -> Result<Registry> {
    let settings = load_settings(cli)?;
    Registry::open(&settings).await.with_context(|| {
        format!(
            "Failed to open registry at {}",
            settings.database_path.display()
        )
    })
}

fn actor(cli: &Cli) -> Actor {
    Actor::new(&cli.user, cli.role)
}

fn parse_structure(json: Option<&str>) -> Result<Option<serde_json::Value>> {
    json.map(|s| serde_json::from_str(s).context("Structure must be valid JSON"))
        .transpose()
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_init(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let registry = Registry::open(&settings)
        .await
        .context("Failed to initialize registry")?;
    let kpis = registry.system_kpis().await?;

    formatter::print_success(&format!(
        "Registry ready at {} ({} environment(s))",
        settings.database_path.display(),
        kpis.environments
    ));
    println!("  {} {}", "assets:".dimmed(), settings.asset_root.display());
    Ok(())
}

async fn cmd_env(cli: &Cli, command: &EnvCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let actor = actor(cli);

    match command {
        EnvCommands::Create {
            id,
            name,
            category,
            roles,
            purpose,
            comment,
        } => {
            let mut env = NewEnvironment::new(id, name, *category);
            env.allowed_roles = roles.clone();
            env.purpose = purpose.clone();
            let created = registry
                .create_environment(&actor, &env, comment.as_deref())
                .await?;
            formatter::print_success(&format!("Created environment '{}'", created.id));
        }
        EnvCommands::List => {
            let envs = registry.visible_environments(actor.role).await?;
            formatter::print_environment_list(&envs);
        }
        EnvCommands::Show { id } => {
            let env = registry.get_environment(id).await?;
            let stats = registry.environment_stats(id).await?;
            formatter::print_environment_detail(&env, &stats);
        }
        EnvCommands::Clone {
            source,
            id,
            name,
            profile,
            category,
            stages,
            plan_from,
            comment,
        } => {
            let mut req = CloneRequest::all_stages(
                source.clone(),
                NewEnvironment::new(id, name, *category),
                *profile,
            );
            if !stages.is_empty() {
                req.stages = stages.iter().copied().collect::<BTreeSet<_>>();
            }
            req.plan_source_env_id = plan_from.clone();
            req.comment = comment.clone();
            let report = registry.clone_environment(&actor, &req).await?;
            formatter::print_clone_report(&report);
            formatter::print_success(&format!(
                "Cloned '{}' into '{}' ({} file(s))",
                source,
                report.environment.id,
                report.total_files()
            ));
        }
        EnvCommands::Promote {
            source,
            id,
            name,
            comment,
        } => {
            let report = registry
                .promote_to_reporting(&actor, source, id, name, comment.as_deref())
                .await?;
            formatter::print_clone_report(&report);
            formatter::print_success(&format!(
                "Promoted '{}' to reporting environment '{}'",
                source, report.environment.id
            ));
        }
        EnvCommands::Status {
            id,
            status,
            comment,
        } => {
            let env = registry
                .update_environment_status(&actor, id, *status, comment)
                .await?;
            formatter::print_success(&format!("Environment '{}' is now {}", env.id, env.status));
        }
        EnvCommands::Edit {
            id,
            name,
            purpose,
            roles,
            status,
            comment,
        } => {
            let edit = EnvironmentEdit {
                name: name.clone(),
                purpose: purpose.clone(),
                allowed_roles: roles.clone(),
                status: *status,
            };
            let env = registry.edit_environment(&actor, id, &edit, comment).await?;
            formatter::print_success(&format!(
                "Environment '{}' updated: {} ({}), roles {}",
                env.id, env.name, env.status, env.allowed_roles
            ));
        }
        EnvCommands::Prune { id, comment } => {
            registry.prune_environment(&actor, id, comment).await?;
            formatter::print_success(&format!("Pruned files of environment '{}'", id));
        }
        EnvCommands::Stats { id } => {
            let stats = registry.environment_stats(id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn cmd_blueprint(cli: &Cli, command: &BlueprintCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let actor = actor(cli);

    match command {
        BlueprintCommands::Create {
            id,
            name,
            stage,
            ext,
            workflow,
            doers,
            reviewers,
            min_kb,
            max_kb,
            structure,
            primary_key,
            source_type,
            source_name,
            source_specifier,
            purpose,
            owner_team,
        } => {
            let mut bp = NewBlueprint::new(id, name, *stage, ext);
            bp.workflow = *workflow;
            bp.doer_roles = doers.clone();
            bp.reviewer_roles = reviewers.clone();
            bp.min_size_kb = *min_kb;
            bp.max_size_kb = *max_kb;
            bp.expected_structure = parse_structure(structure.as_deref())?;
            bp.primary_key_column = primary_key.clone();
            bp.source_type = *source_type;
            bp.source_name = source_name.clone();
            bp.source_specifier = source_specifier.clone();
            bp.purpose = purpose.clone();
            bp.owner_team = owner_team.clone();
            let created = registry.create_blueprint(&actor, &bp).await?;
            formatter::print_success(&format!(
                "Created blueprint '{}' for {}",
                created.id, created.stage
            ));
        }
        BlueprintCommands::List { stage } => {
            let blueprints = registry.list_blueprints(*stage).await?;
            formatter::print_blueprint_list(&blueprints);
        }
        BlueprintCommands::Show { id } => {
            let bp = registry.get_blueprint(id).await?;
            formatter::print_blueprint_detail(&bp);
        }
        BlueprintCommands::Archive { id } => {
            registry.archive_blueprint(&actor, id).await?;
            formatter::print_success(&format!("Archived blueprint '{}'", id));
        }
        BlueprintCommands::Delete { id } => {
            registry.delete_blueprint(&actor, id).await?;
            formatter::print_success(&format!("Deleted blueprint '{}'", id));
        }
    }
    Ok(())
}

async fn cmd_file(cli: &Cli, command: &FileCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let actor = actor(cli);

    match command {
        FileCommands::Add {
            env,
            blueprint,
            path,
            parents,
            structure,
        } => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                bail!("'{}' is not a file path", path.display());
            };
            let mut content = Content::new(file_name, bytes);
            if let Some(structure) = parse_structure(structure.as_deref())? {
                content = content.with_structure(structure);
            }
            let instance = registry
                .create_version(&actor, env, blueprint, &content, parents)
                .await?;
            formatter::print_success(&format!(
                "Registered {} at {}",
                instance.file_ref(),
                instance.rel_path
            ));
        }
        FileCommands::List { env, stage } => {
            let files = registry.list_files(env, *stage).await?;
            formatter::print_file_list(&files);
        }
        FileCommands::Status { file } => {
            let governed = registry.governance_status(*file).await?;
            let trail = registry.audit_for(&Target::File(*file)).await?;
            formatter::print_file_detail(&governed, &trail);
        }
        FileCommands::Inbox { env, stage } => {
            let inbox = registry.inbox(&actor, env, *stage).await?;
            formatter::print_inbox(&inbox);
        }
        FileCommands::Fetch {
            env,
            blueprint,
            parents,
        } => {
            let instance = registry
                .fetch_external(&actor, env, blueprint, parents)
                .await?;
            formatter::print_success(&format!(
                "Fetched {} into {}",
                instance.file_ref(),
                instance.rel_path
            ));
        }
    }
    Ok(())
}

async fn cmd_signoff(
    cli: &Cli,
    file: FileRef,
    action: SignOffAction,
    capacity: Capacity,
    comment: &str,
) -> Result<()> {
    let registry = open_registry(cli).await?;
    let entry = registry
        .sign_off(&actor(cli), file, action, capacity, comment)
        .await?;
    let status = registry.governance_status(file).await?.status;
    formatter::print_success(&format!(
        "{} recorded on {} as {} (now {})",
        entry.action, file, entry.capacity, status
    ));
    Ok(())
}

async fn cmd_audit(cli: &Cli, command: &AuditCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let entries = match command {
        AuditCommands::Target { target } => registry.audit_for(target).await?,
        AuditCommands::Actor { actor, limit } => registry.audit_by_actor(actor, *limit).await?,
        AuditCommands::Recent { limit } => registry.recent_audit(*limit).await?,
    };
    formatter::print_audit(&entries);
    Ok(())
}

async fn cmd_lineage(cli: &Cli, command: &LineageCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    match command {
        LineageCommands::Up { file } => {
            let links = registry.lineage_upstream(*file).await?;
            formatter::print_lineage(&links, true);
        }
        LineageCommands::Down { file } => {
            let links = registry.lineage_downstream(*file).await?;
            formatter::print_lineage(&links, false);
        }
    }
    Ok(())
}

async fn cmd_plan(cli: &Cli, command: &PlanCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let actor = actor(cli);
    let planner = registry.planner();

    match command {
        PlanCommands::Add {
            env,
            title,
            duration,
            due,
            owner,
            after,
        } => {
            let id = registry
                .create_milestone(
                    &actor,
                    &NewMilestone {
                        env_id: env.clone(),
                        title: title.clone(),
                        duration_days: *duration,
                        due_date: *due,
                        owner: owner.clone(),
                        predecessor_ids: after.clone(),
                        target: None,
                    },
                )
                .await?;
            formatter::print_success(&format!("Created milestone #{}", id));
        }
        PlanCommands::Depend { task, predecessor } => {
            registry.add_dependency(&actor, *task, *predecessor).await?;
            formatter::print_success(&format!("#{} now depends on #{}", task, predecessor));
        }
        PlanCommands::Undepend { task, predecessor } => {
            planner
                .remove_dependency(&actor, *task, *predecessor)
                .await?;
            formatter::print_success(&format!(
                "#{} no longer depends on #{}",
                task, predecessor
            ));
        }
        PlanCommands::Complete { id } => {
            planner.complete(&actor, *id).await?;
            formatter::print_success(&format!("Milestone #{} complete", id));
        }
        PlanCommands::Reopen { id } => {
            planner.reopen(&actor, *id).await?;
            formatter::print_success(&format!("Milestone #{} reopened", id));
        }
        PlanCommands::Remove { id } => {
            planner.delete_milestone(&actor, *id).await?;
            formatter::print_success(&format!("Removed milestone #{}", id));
        }
        PlanCommands::List { env } => {
            let milestones = planner.list_milestones(env).await?;
            formatter::print_milestones(&milestones);
        }
        PlanCommands::Schedule { env } => {
            let schedule = registry.compute_schedule(env).await?;
            let milestones = planner.list_milestones(env).await?;
            formatter::print_schedule(&schedule, &milestones);
        }
    }
    Ok(())
}

async fn cmd_action(cli: &Cli, command: &ActionCommands) -> Result<()> {
    let registry = open_registry(cli).await?;
    let actor = actor(cli);
    let planner = registry.planner();

    match command {
        ActionCommands::Add {
            env,
            description,
            owner,
            due,
        } => {
            let item = planner
                .create_action_item(
                    &actor,
                    &NewActionItem {
                        env_id: env.clone(),
                        description: description.clone(),
                        owner: owner.clone(),
                        due_date: *due,
                        target: None,
                    },
                )
                .await?;
            formatter::print_success(&format!("Opened action item #{}", item.id));
        }
        ActionCommands::Close { id, comment } => {
            planner.close_action_item(&actor, *id, comment).await?;
            formatter::print_success(&format!("Closed action item #{}", id));
        }
        ActionCommands::List { env, open } => {
            let status = open.then_some(ActionStatus::Open);
            let items = planner.action_items(env, status).await?;
            formatter::print_action_items(&items);
        }
    }
    Ok(())
}

async fn cmd_health(cli: &Cli) -> Result<()> {
    let registry = open_registry(cli).await?;
    let report = registry.health().await?;
    formatter::print_health(&report);
    if !report.is_healthy() {
        bail!(
            "{} missing file(s), {} hash mismatch(es), {} orphaned folder(s)",
            report.orphaned_instances.len(),
            report.hash_mismatches.len(),
            report.orphaned_folders.len()
        );
    }
    Ok(())
}

async fn cmd_kpis(cli: &Cli) -> Result<()> {
    let registry = open_registry(cli).await?;
    let kpis = registry.system_kpis().await?;
    formatter::print_kpis(&kpis);
    let pending = registry.pending_doer_signoffs(10).await?;
    if !pending.is_empty() {
        println!("{}", "Awaiting Doer sign-off".bold().cyan());
        for f in pending {
            println!("  {:<16} {:<22} {}", f.file_ref().to_string(), f.blueprint_id, f.env_id);
        }
        println!();
    }
    Ok(())
}
