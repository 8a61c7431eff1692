use colored::Colorize;

use crate::governance::{GovernanceStatus, GovernedInstance, Inbox};
use crate::health::HealthReport;
use crate::planning::Schedule;
use crate::state::kinds::{ActionStatus, EnvStatus, InstanceStatus, MilestoneStatus};
use crate::state::models::{
    ActionItem, AuditEntry, Blueprint, CloneReport, Environment, EnvironmentStats, FileInstance,
    LineageLink, Milestone, SystemKpis,
};

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg.yellow());
}

fn header(title: &str, width: usize) {
    println!();
    println!("{}", title.bold().cyan());
    println!("{}", "─".repeat(width));
}

fn env_status(status: EnvStatus) -> String {
    let text = status.to_string();
    match status {
        EnvStatus::Active => text.green().to_string(),
        EnvStatus::Locked => text.yellow().to_string(),
        EnvStatus::Archived => text.dimmed().to_string(),
        EnvStatus::Pending => text.blue().to_string(),
        EnvStatus::Rejected => text.red().to_string(),
    }
}

fn governance_status(status: GovernanceStatus) -> String {
    let text = status.to_string();
    match status {
        GovernanceStatus::FullyApproved => text.green().to_string(),
        GovernanceStatus::PendingDoer | GovernanceStatus::PendingReview => {
            text.yellow().to_string()
        }
        GovernanceStatus::Rejected => text.red().to_string(),
        GovernanceStatus::Superseded => text.dimmed().to_string(),
    }
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

// ─── Environments ───────────────────────────────────────────────────────────

pub fn print_environment_list(envs: &[Environment]) {
    if envs.is_empty() {
        println!("{}", "No environments.".dimmed());
        return;
    }

    header("Environments", 80);
    println!(
        "  {:<20} {:<24} {:<12} {}",
        "ID".bold(),
        "NAME".bold(),
        "CATEGORY".bold(),
        "STATUS".bold()
    );
    println!("{}", "─".repeat(80));
    for env in envs {
        println!(
            "  {:<20} {:<24} {:<12} {}",
            env.id,
            env.name,
            env.category.to_string(),
            env_status(env.status)
        );
    }
    println!();
    println!("  {} environment(s) total.", envs.len());
    println!();
}

pub fn print_environment_detail(env: &Environment, stats: &EnvironmentStats) {
    println!();
    println!("{} {}", "Environment:".bold().cyan(), env.id.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Name:".bold(), env.name);
    println!("  {:<18} {}", "Category:".bold(), env.category);
    println!("  {:<18} {}", "Status:".bold(), env_status(env.status));
    println!("  {:<18} {}", "Roles:".bold(), env.allowed_roles);
    println!("  {:<18} {}", "Purpose:".bold(), or_dash(env.purpose.as_deref()));
    if let Some(source) = &env.source_environment_id {
        println!("  {:<18} {}", "Cloned from:".bold(), source);
    }
    println!("  {:<18} {} by {}", "Created:".bold(), env.created_at, env.created_by);
    println!();
    println!("  {}:", "Files".bold());
    for (stage, n) in &stats.files_by_stage {
        println!("    {:<16} {}", stage.to_string(), n);
    }
    println!(
        "    {:<16} {} of {}",
        "active",
        stats.active_files,
        stats.total_files()
    );
    println!(
        "  {:<18} {}/{} complete",
        "Plan:".bold(),
        stats.plan_tasks_complete,
        stats.plan_tasks
    );
    println!("  {:<18} {} open", "Action items:".bold(), stats.open_action_items);
    println!("{}", "─".repeat(60));
    println!();
}

pub fn print_clone_report(report: &CloneReport) {
    println!();
    println!(
        "{} {} ({})",
        "Cloned into".bold().cyan(),
        report.environment.id.bold(),
        report.profile
    );
    println!("{}", "─".repeat(60));
    for (stage, n) in &report.files_cloned {
        println!("  {:<18} {}", format!("{}:", stage).bold(), n);
    }
    println!(
        "  {:<18} {} copied, {} dropped",
        "Lineage:".bold(),
        report.lineage_copied,
        report.lineage_dropped
    );
    if report.audit_replayed > 0 {
        println!("  {:<18} {}", "Audit replayed:".bold(), report.audit_replayed);
    }
    if let Some(plan) = &report.plan {
        println!(
            "  {:<18} {} task(s), {} dependenc(ies), {} dropped (from {})",
            "Plan:".bold(),
            plan.tasks_cloned,
            plan.dependencies_cloned,
            plan.dependencies_dropped,
            plan.source_env_id
        );
    }
    for warning in &report.warnings {
        print_warning(warning);
    }
    println!();
}

// ─── Blueprints ─────────────────────────────────────────────────────────────

pub fn print_blueprint_list(blueprints: &[Blueprint]) {
    if blueprints.is_empty() {
        println!("{}", "No blueprints.".dimmed());
        return;
    }

    header("Blueprints", 80);
    println!(
        "  {:<22} {:<12} {:<8} {:<20} {}",
        "ID".bold(),
        "STAGE".bold(),
        "EXT".bold(),
        "WORKFLOW".bold(),
        "STATUS".bold()
    );
    println!("{}", "─".repeat(80));
    for bp in blueprints {
        println!(
            "  {:<22} {:<12} {:<8} {:<20} {}",
            bp.id,
            bp.stage.to_string(),
            bp.expected_extension,
            bp.workflow.to_string(),
            bp.status.to_string().dimmed()
        );
    }
    println!();
}

pub fn print_blueprint_detail(bp: &Blueprint) {
    println!();
    println!("{} {}", "Blueprint:".bold().cyan(), bp.id.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Name:".bold(), bp.name);
    println!("  {:<18} {}", "Stage:".bold(), bp.stage);
    println!("  {:<18} {}", "Status:".bold(), bp.status);
    println!("  {:<18} {}", "Workflow:".bold(), bp.workflow);
    println!("  {:<18} {}", "Doers:".bold(), bp.doer_roles);
    println!("  {:<18} {}", "Reviewers:".bold(), bp.reviewer_roles);
    println!("  {:<18} {}", "Extension:".bold(), bp.expected_extension);
    if bp.min_size_kb.is_some() || bp.max_size_kb.is_some() {
        println!(
            "  {:<18} {} .. {} KB",
            "Size:".bold(),
            bp.min_size_kb.map_or("-".to_string(), |v| v.to_string()),
            bp.max_size_kb.map_or("-".to_string(), |v| v.to_string())
        );
    }
    if let Some(structure) = &bp.expected_structure {
        println!("  {:<18} {}", "Structure:".bold(), structure);
    }
    if let Some(source) = bp.source_type {
        println!(
            "  {:<18} {} {} {}",
            "Source:".bold(),
            source,
            or_dash(bp.source_name.as_deref()),
            or_dash(bp.source_specifier.as_deref())
        );
    }
    println!("  {:<18} {}", "Purpose:".bold(), or_dash(bp.purpose.as_deref()));
    println!("{}", "─".repeat(60));
    println!();
}

// ─── Files ──────────────────────────────────────────────────────────────────

pub fn print_file_list(files: &[GovernedInstance]) {
    if files.is_empty() {
        println!("{}", "No file instances.".dimmed());
        return;
    }

    header("Files", 96);
    println!(
        "  {:<16} {:<22} {:<12} {:<16} {}",
        "FILE".bold(),
        "BLUEPRINT".bold(),
        "RECORD".bold(),
        "GOVERNANCE".bold(),
        "CREATED".bold()
    );
    println!("{}", "─".repeat(96));
    for g in files {
        let record = g.instance.status.to_string();
        let record = if g.instance.status == InstanceStatus::Active {
            record.green().to_string()
        } else {
            record.dimmed().to_string()
        };
        println!(
            "  {:<16} {:<22} {:<12} {:<16} {}",
            g.instance.file_ref().to_string(),
            g.instance.blueprint_id,
            record,
            governance_status(g.status),
            g.instance.created_at.dimmed()
        );
    }
    println!();
    println!("  {} file(s) total.", files.len());
    println!();
}

pub fn print_file_detail(g: &GovernedInstance, trail: &[AuditEntry]) {
    let i = &g.instance;
    println!();
    println!("{} {}", "File:".bold().cyan(), i.file_ref().to_string().bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Blueprint:".bold(), i.blueprint_id);
    println!("  {:<18} {}", "Environment:".bold(), i.env_id);
    println!("  {:<18} {}", "Path:".bold(), i.rel_path);
    println!("  {:<18} {}", "SHA-256:".bold(), i.content_hash);
    println!("  {:<18} {} bytes", "Size:".bold(), i.size_bytes);
    println!("  {:<18} {}", "Record:".bold(), i.status);
    println!("  {:<18} {}", "Governance:".bold(), governance_status(g.status));
    if let Some(summary) = &i.validation_summary {
        println!("  {:<18} {}", "Validation:".bold(), summary);
    }
    println!("  {:<18} {} by {}", "Created:".bold(), i.created_at, i.created_by);
    if !trail.is_empty() {
        println!();
        println!("  {}:", "Audit".bold());
        for e in trail {
            print_audit_line(e, 4);
        }
    }
    println!("{}", "─".repeat(60));
    println!();
}

pub fn print_inbox(inbox: &Inbox) {
    let section = |title: &str, files: &[FileInstance]| {
        println!("{}", title.bold().cyan());
        if files.is_empty() {
            println!("  {}", "nothing waiting".dimmed());
        }
        for f in files {
            println!(
                "  {:<16} {:<22} {}",
                f.file_ref().to_string(),
                f.blueprint_id,
                f.created_at.dimmed()
            );
        }
    };
    println!();
    section("Awaiting your Doer sign-off", &inbox.pending_doer);
    println!();
    section("Awaiting your review", &inbox.pending_reviewer);
    println!();
}

pub fn print_lineage(links: &[LineageLink], upstream: bool) {
    if links.is_empty() {
        println!("{}", "No lineage links.".dimmed());
        return;
    }
    for link in links {
        if upstream {
            println!("  {} {} {}", link.child, "<-".cyan(), link.parent);
        } else {
            println!("  {} {} {}", link.parent, "->".cyan(), link.child);
        }
    }
}

// ─── Audit ──────────────────────────────────────────────────────────────────

fn print_audit_line(e: &AuditEntry, indent: usize) {
    println!(
        "{:indent$}{} {:<14} {:<18} {:<10} {:<12} {}",
        "",
        e.timestamp.dimmed(),
        e.action.to_string().bold(),
        e.target.to_string(),
        e.capacity.to_string(),
        e.actor,
        or_dash(e.comment.as_deref()),
        indent = indent
    );
}

pub fn print_audit(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("{}", "No audit entries.".dimmed());
        return;
    }
    header("Audit trail", 100);
    for e in entries {
        print_audit_line(e, 2);
    }
    println!();
}

// ─── Planning ───────────────────────────────────────────────────────────────

pub fn print_milestones(milestones: &[Milestone]) {
    if milestones.is_empty() {
        println!("{}", "No milestones.".dimmed());
        return;
    }
    header("Milestones", 80);
    println!(
        "  {:<6} {:<30} {:<6} {:<12} {:<14} {}",
        "ID".bold(),
        "TITLE".bold(),
        "DAYS".bold(),
        "DUE".bold(),
        "OWNER".bold(),
        "STATUS".bold()
    );
    println!("{}", "─".repeat(80));
    for m in milestones {
        let status = match m.status {
            MilestoneStatus::Complete => m.status.to_string().green().to_string(),
            MilestoneStatus::Pending => m.status.to_string(),
        };
        println!(
            "  {:<6} {:<30} {:<6} {:<12} {:<14} {}",
            m.id,
            m.title,
            m.duration_days,
            m.due_date.map_or("-".to_string(), |d| d.to_string()),
            m.owner,
            status
        );
    }
    println!();
}

pub fn print_schedule(schedule: &Schedule, milestones: &[Milestone]) {
    header("Schedule", 80);
    let title = |id: i64| {
        milestones
            .iter()
            .find(|m| m.id == id)
            .map_or("?", |m| m.title.as_str())
    };
    for (id, dates) in &schedule.tasks {
        let marker = if schedule.kpis.critical_path.contains(id) {
            "*".red().bold().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "  {} #{:<5} {:<30} {} → {}",
            marker,
            id,
            title(*id),
            dates.start,
            dates.due
        );
    }
    println!("{}", "─".repeat(80));
    let k = &schedule.kpis;
    if let (Some(start), Some(end)) = (k.project_start, k.project_end) {
        println!(
            "  {:<18} {} → {} ({} days)",
            "Project:".bold(),
            start,
            end,
            k.total_duration_days
        );
    }
    if !k.critical_path.is_empty() {
        let path: Vec<String> = k.critical_path.iter().map(|id| format!("#{}", id)).collect();
        println!("  {:<18} {}", "Critical path:".bold(), path.join(" → "));
    }
    for cycle in &schedule.cycle_errors {
        let ids: Vec<String> = cycle.iter().map(|id| format!("#{}", id)).collect();
        print_error(&format!("dependency cycle: {}", ids.join(", ")));
    }
    for warning in &schedule.warnings {
        print_warning(&warning.to_string());
    }
    println!();
}

pub fn print_action_items(items: &[ActionItem]) {
    if items.is_empty() {
        println!("{}", "No action items.".dimmed());
        return;
    }
    header("Action items", 80);
    for item in items {
        let status = match item.status {
            ActionStatus::Open => item.status.to_string().yellow().to_string(),
            ActionStatus::Closed => item.status.to_string().dimmed().to_string(),
        };
        println!(
            "  #{:<5} {:<8} {:<14} {:<12} {}",
            item.id,
            status,
            item.owner,
            item.due_date.map_or("-".to_string(), |d| d.to_string()),
            item.description
        );
    }
    println!();
}

// ─── Dashboards ─────────────────────────────────────────────────────────────

pub fn print_health(report: &HealthReport) {
    header("Health", 60);
    for m in &report.orphaned_instances {
        print_error(&format!("{} in '{}' is missing {}", m.file, m.env_id, m.rel_path));
    }
    for folder in &report.orphaned_folders {
        print_warning(&format!("folder '{}' has no environment", folder));
    }
    for err in report.integrity_errors() {
        print_error(&err.to_string());
    }
    for bp in &report.unused_blueprints {
        println!("  {} blueprint '{}' is unused", "·".dimmed(), bp);
    }
    if report.is_healthy() {
        print_success("Registry and asset tree are consistent.");
    }
    println!();
}

pub fn print_kpis(kpis: &SystemKpis) {
    header("System", 60);
    println!(
        "  {:<20} {} ({} active)",
        "Environments:".bold(),
        kpis.environments,
        kpis.active_environments
    );
    println!("  {:<20} {}", "Blueprints:".bold(), kpis.blueprints);
    for (stage, n) in &kpis.files_by_stage {
        println!("  {:<20} {}", format!("{} files:", stage).bold(), n);
    }
    println!("  {:<20} {}", "Active files:".bold(), kpis.active_files);
    println!("  {:<20} {}", "Audit entries:".bold(), kpis.audit_entries);
    println!("  {:<20} {}", "Milestones:".bold(), kpis.milestones);
    println!("  {:<20} {}", "Open actions:".bold(), kpis.open_action_items);
    println!();
}
