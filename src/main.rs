//! Conductor CLI
//!
//! Quality-gated phase orchestration for multi-agent software delivery.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use conductor::schedule::{self, Frequency, RecurringPattern, RetryConfig, ScheduleSpec};
use conductor::workflow::{
    ApprovalEvent, ChecklistStatus, ComplianceCategory, Measurement, QualityMeasurementEvent,
    TaskCompletionEvent, TaskOutcome, VoteDecision, VoteEvent, WorkflowTemplate,
};
use conductor::{Config, Orchestrator, Phase, Result};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "Quality-gated phase orchestration")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .conductor directory
    Init,

    /// Show current configuration
    Config,

    /// Inspect workflow templates
    Template {
        #[command(subcommand)]
        action: TemplateCommands,
    },

    /// Compute the next fire time of a schedule
    NextRun {
        #[command(subcommand)]
        schedule: NextRunCommands,

        /// IANA timezone the schedule is evaluated in
        #[arg(long, short, global = true, default_value = "UTC")]
        timezone: String,

        /// Evaluate as of this instant (RFC 3339) instead of now
        #[arg(long, global = true)]
        now: Option<DateTime<Utc>>,
    },

    /// Show the backoff delay after a failed attempt
    RetryDelay {
        /// Failed attempt number (1-based)
        attempt: u32,

        /// Initial delay in seconds (default: from config)
        #[arg(long)]
        initial: Option<u64>,

        /// Maximum delay in seconds (default: from config)
        #[arg(long)]
        max: Option<u64>,

        /// Backoff multiplier (default: from config)
        #[arg(long)]
        multiplier: Option<f64>,
    },

    /// Workflow instance commands
    Workflow {
        #[command(subcommand)]
        action: WorkflowCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Show the configured template
    Show,

    /// Validate a template file (default: the configured template)
    Validate {
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum NextRunCommands {
    /// Cron expression (5 fields minute-first, or 6/7 fields seconds-first)
    Cron { expression: String },

    /// Fixed interval from now
    Interval {
        value: u32,
        /// minutes, hours or days
        unit: String,
    },

    /// Single run at an instant
    Once {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Wall-clock pattern
    Recurring {
        #[arg(long, value_enum)]
        frequency: FrequencyArg,

        /// Local time, HH:MM or HH:MM:SS
        #[arg(long)]
        time: String,

        /// Weekdays for weekly patterns (e.g. mon,thu)
        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FrequencyArg {
    Daily,
    Weekdays,
    Weekly,
}

impl From<FrequencyArg> for Frequency {
    fn from(arg: FrequencyArg) -> Self {
        match arg {
            FrequencyArg::Daily => Frequency::Daily,
            FrequencyArg::Weekdays => Frequency::Weekdays,
            FrequencyArg::Weekly => Frequency::Weekly,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
    Retract,
}

impl From<DecisionArg> for VoteDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => VoteDecision::Approve,
            DecisionArg::Reject => VoteDecision::Reject,
            DecisionArg::Retract => VoteDecision::Retract,
        }
    }
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Create a workflow instance for a parent task
    Create {
        #[arg(long)]
        project: String,

        #[arg(long)]
        parent_task: String,

        /// Template name (default: the configured template)
        #[arg(long)]
        template: Option<String>,

        /// Start immediately
        #[arg(long)]
        start: bool,
    },

    /// Start an instance and dispatch its first phases
    Start { id: Uuid },

    /// Show instance status
    Status { id: Uuid },

    /// List instances, newest first
    List {
        /// Show only last N instances
        #[arg(long, default_value = "10")]
        last: usize,
    },

    /// Attempt to complete a phase
    Advance { id: Uuid, phase: Phase },

    /// Show deployment readiness
    Readiness { id: Uuid },

    /// Cast a redundancy vote
    Vote {
        id: Uuid,
        phase: Phase,
        #[arg(value_enum)]
        decision: DecisionArg,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        agent_type: String,
    },

    /// Record an automated measurement
    Measure {
        id: Uuid,
        gate: String,
        criterion: String,
        value: f64,
        #[arg(long)]
        agent: Option<String>,
    },

    /// Approve (or reject) a manual or agent-review criterion
    Approve {
        id: Uuid,
        gate: String,
        criterion: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        note: Option<String>,
    },

    /// Report a dispatched task as finished
    CompleteTask {
        id: Uuid,
        task_id: String,
        /// Report a failure with this error instead of success
        #[arg(long)]
        failed: Option<String>,
    },

    /// Assign remediation work for a failed gate
    Remediate {
        id: Uuid,
        gate: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        agent_type: String,
    },

    /// Mark a compliance checklist item
    Checklist {
        id: Uuid,
        category: ComplianceCategory,
        status: ChecklistStatus,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Fail an instance (operator override)
    Fail {
        id: Uuid,
        #[arg(long)]
        reason: String,
    },

    /// List tasks due for dispatch
    Due {
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Load config
    let config = Config::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            let created = conductor::config::init(&std::env::current_dir()?)?;
            for path in &created {
                println!("Created {}", path.display());
            }
            info!("Initialized .conductor directory");
        }

        Commands::Config => {
            let s = toml::to_string_pretty(&config)
                .map_err(|e| conductor::Error::Config(e.to_string()))?;
            println!("{}", s);
        }

        Commands::Template { action } => handle_template_command(action, &config, json)?,

        Commands::NextRun {
            schedule: spec,
            timezone,
            now,
        } => {
            let spec = match spec {
                NextRunCommands::Cron { expression } => ScheduleSpec::Cron { expression },
                NextRunCommands::Interval { value, unit } => ScheduleSpec::Interval {
                    interval_value: value,
                    interval_unit: unit,
                },
                NextRunCommands::Once { at } => ScheduleSpec::OneTime { run_at: at },
                NextRunCommands::Recurring {
                    frequency,
                    time,
                    days,
                } => ScheduleSpec::Recurring(RecurringPattern {
                    frequency: frequency.into(),
                    time,
                    days_of_week: days,
                }),
            };
            let now = now.unwrap_or_else(Utc::now);
            let next = schedule::next_run(&spec, &timezone, now)?;

            if json {
                print_json(&serde_json::json!({
                    "schedule": spec,
                    "timezone": timezone,
                    "now": now,
                    "next_run": next,
                }))?;
            } else {
                match next {
                    Some(at) => println!("{}", at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    None => println!("No further runs"),
                }
            }
        }

        Commands::RetryDelay {
            attempt,
            initial,
            max,
            multiplier,
        } => {
            let retry = RetryConfig {
                initial_delay_seconds: initial.unwrap_or(config.retry.initial_delay_seconds),
                max_delay_seconds: max.unwrap_or(config.retry.max_delay_seconds),
                backoff_multiplier: multiplier.unwrap_or(config.retry.backoff_multiplier),
                ..config.retry.clone()
            };
            retry.validate()?;
            let delay = retry.delay_for_attempt(attempt);

            if json {
                print_json(&serde_json::json!({
                    "attempt": attempt,
                    "delay_seconds": delay.as_secs(),
                }))?;
            } else {
                println!(
                    "Attempt {}: retry in {} ({}s)",
                    attempt,
                    humantime::format_duration(delay),
                    delay.as_secs()
                );
            }
        }

        Commands::Workflow { action } => {
            let template = config.load_template()?;
            let orchestrator = Orchestrator::new(config.open_store(), config.clone());
            orchestrator.initialize().await?;
            orchestrator.register_template(template).await?;

            let result = handle_workflow_command(action, &orchestrator, json).await;
            orchestrator.shutdown().await?;
            result?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Handle template subcommands
fn handle_template_command(action: TemplateCommands, config: &Config, json: bool) -> Result<()> {
    match action {
        TemplateCommands::Show => {
            let template = config.load_template()?;
            if json {
                print_json(&template)?;
            } else {
                println!("{}", template.summary());
            }
        }

        TemplateCommands::Validate { path } => {
            let template = match path {
                Some(path) => WorkflowTemplate::load(&path)?,
                None => config.load_template()?,
            };
            println!(
                "Template {} is valid ({} phases, {} gates)",
                template.name,
                template.phases.len(),
                template.gates.len()
            );
        }
    }
    Ok(())
}

/// Handle workflow subcommands
async fn handle_workflow_command(
    action: WorkflowCommands,
    orchestrator: &Orchestrator,
    json: bool,
) -> Result<()> {
    match action {
        WorkflowCommands::Create {
            project,
            parent_task,
            template,
            start,
        } => {
            let template = match template {
                Some(name) => name,
                None => orchestrator.config().load_template()?.name,
            };
            let instance = orchestrator
                .create_instance(&template, &project, &parent_task)
                .await?;
            if start {
                orchestrator.start(instance.id).await?;
            }
            let instance = orchestrator.instance_status(instance.id).await?;

            if json {
                print_json(&instance)?;
            } else {
                println!("Created workflow {}", instance.id);
            }
        }

        WorkflowCommands::Start { id } => {
            let tasks = orchestrator.start(id).await?;
            if json {
                print_json(&tasks)?;
            } else {
                println!("Dispatched {} task(s)", tasks.len());
                for task in &tasks {
                    println!("  {} [{}] {} ({})", task.id, task.phase, task.title, task.agent_type);
                }
            }
        }

        WorkflowCommands::Status { id } => {
            let record = orchestrator.record(id).await?;
            if json {
                print_json(&record.instance)?;
            } else {
                let template = orchestrator.template(&record.instance.template).await?;
                println!("{}", record.instance.summary(&template));
                let open: Vec<_> = record.tasks.iter().filter(|t| t.is_outstanding()).collect();
                if !open.is_empty() {
                    println!("\nOutstanding tasks:");
                    for task in open {
                        println!("  {} [{}] {} ({})", task.id, task.phase, task.title, task.status);
                    }
                }
            }
        }

        WorkflowCommands::List { last } => {
            let instances = orchestrator.list_instances().await?;
            let instances: Vec<_> = instances.into_iter().take(last).collect();
            if json {
                print_json(&instances)?;
            } else if instances.is_empty() {
                println!("No workflow instances");
            } else {
                for instance in instances {
                    let phase = instance
                        .current_phase
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {:<12} {:<16} {} / {}",
                        instance.id, instance.status, phase, instance.project_id, instance.parent_task_id
                    );
                }
            }
        }

        WorkflowCommands::Advance { id, phase } => {
            let outcome = orchestrator.advance_phase(id, &phase).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("{}", outcome);
                for blocker in outcome.blockers() {
                    println!("  {}", blocker);
                }
            }
        }

        WorkflowCommands::Readiness { id } => {
            let checklist = orchestrator.deployment_readiness(id).await?;
            if json {
                print_json(&checklist)?;
            } else {
                println!("{}", checklist.summary());
            }
        }

        WorkflowCommands::Vote {
            id,
            phase,
            decision,
            agent,
            agent_type,
        } => {
            let outcome = orchestrator
                .submit_vote(VoteEvent {
                    instance_id: id,
                    phase,
                    agent_id: agent,
                    agent_type,
                    decision: decision.into(),
                    cast_at: None,
                })
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Recorded {} from {} (#{})",
                    outcome.vote.decision, outcome.vote.agent_id, outcome.vote.sequence
                );
                if let Some(verdict) = &outcome.verdict {
                    match &verdict.reason {
                        None => println!("Approval satisfied ({})", verdict.rule),
                        Some(reason) => println!("Approval pending: {}", reason),
                    }
                }
                if let Some(advance) = &outcome.advance {
                    println!("{}", advance);
                }
            }
        }

        WorkflowCommands::Measure {
            id,
            gate,
            criterion,
            value,
            agent,
        } => {
            let outcome = orchestrator
                .record_measurement(QualityMeasurementEvent {
                    instance_id: id,
                    gate_id: gate,
                    criterion_id: criterion,
                    measurement: Measurement::Value {
                        measured_value: value,
                        agent_id: agent,
                    },
                })
                .await?;
            print_measurement(&outcome, json)?;
        }

        WorkflowCommands::Approve {
            id,
            gate,
            criterion,
            agent,
            reject,
            note,
        } => {
            let outcome = orchestrator
                .record_measurement(QualityMeasurementEvent {
                    instance_id: id,
                    gate_id: gate,
                    criterion_id: criterion,
                    measurement: Measurement::Approval(ApprovalEvent {
                        agent_id: agent,
                        approved: !reject,
                        note,
                    }),
                })
                .await?;
            print_measurement(&outcome, json)?;
        }

        WorkflowCommands::CompleteTask {
            id,
            task_id,
            failed,
        } => {
            let phase = orchestrator.record(id).await?.task(&task_id)?.phase.clone();
            let outcome = match failed {
                Some(error) => TaskOutcome::Failed { error },
                None => TaskOutcome::Succeeded,
            };
            let advance = orchestrator
                .handle_task_completion(TaskCompletionEvent {
                    instance_id: id,
                    task_id: task_id.clone(),
                    phase,
                    outcome,
                })
                .await?;
            let task = orchestrator.record(id).await?.task(&task_id)?.clone();

            if json {
                print_json(&serde_json::json!({ "task": task, "advance": advance }))?;
            } else {
                println!("Task {} is {}", task.id, task.status);
                if let Some(at) = task.scheduled_for.filter(|_| task.is_outstanding()) {
                    println!("  retry scheduled for {}", at.to_rfc3339_opts(SecondsFormat::Secs, true));
                }
                if let Some(advance) = advance {
                    println!("{}", advance);
                }
            }
        }

        WorkflowCommands::Remediate {
            id,
            gate,
            title,
            agent_type,
        } => {
            let task = orchestrator
                .assign_remediation(id, &gate, &title, &agent_type)
                .await?;
            if json {
                print_json(&task)?;
            } else {
                println!("Assigned remediation task {} for gate {}", task.id, gate);
            }
        }

        WorkflowCommands::Checklist {
            id,
            category,
            status,
            agent,
            notes,
        } => {
            let item = orchestrator
                .mark_checklist_item(id, category, status, &agent, notes)
                .await?;
            if json {
                print_json(&item)?;
            } else {
                println!("{}: {}", item.category, item.status);
            }
        }

        WorkflowCommands::Fail { id, reason } => {
            let instance = orchestrator.fail(id, &reason).await?;
            if json {
                print_json(&instance)?;
            } else {
                println!("Workflow {} is {}", instance.id, instance.status);
            }
        }

        WorkflowCommands::Due { now } => {
            let due = orchestrator.due_tasks(now.unwrap_or_else(Utc::now)).await?;
            if json {
                print_json(&due)?;
            } else if due.is_empty() {
                println!("No tasks due");
            } else {
                for item in due {
                    println!(
                        "{} {} [{}] {} ({})",
                        item.instance_id, item.task.id, item.task.phase, item.task.title, item.task.agent_type
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_measurement(outcome: &conductor::orchestrator::MeasurementOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }
    println!("{}", outcome.verdict.summary());
    if let Some(task) = &outcome.recheck {
        if let Some(at) = task.scheduled_for {
            println!("  re-check scheduled for {}", at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
    if outcome.exhausted {
        println!("  retries exhausted");
    }
    if let Some(advance) = &outcome.advance {
        println!("{}", advance);
    }
    Ok(())
}
