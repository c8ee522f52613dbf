//! fan-queue - Manage the fanout posting queue
//!
//! Unix-style tool for adding posts to the queue and inspecting or
//! correcting them afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libfanout::logging::{LogFormat, LoggingConfig};
use libfanout::scheduling::{parse_duration, parse_schedule};
use libfanout::service::creation::{NewPost, ScheduleRequest};
use libfanout::service::CancelOutcome;
use libfanout::store::StatusCounts;
use libfanout::types::{Frequency, MediaAttachment, MediaKind};
use libfanout::{Config, Database, FanoutError, Post, PostFilter, PostStatus, Priority, QueueService};

#[derive(Parser, Debug)]
#[command(name = "fan-queue")]
#[command(version)]
#[command(about = "Manage the fanout posting queue")]
#[command(long_about = "\
fan-queue - Manage the fanout posting queue

DESCRIPTION:
    fan-queue adds posts to the fanout queue and lets you inspect, cancel,
    or retry them. Publishing itself is done by fan-send.

COMMANDS:
    add      Queue a new post
    list     List posts
    show     Show one post with its platform states and error log
    cancel   Cancel a post
    reset    Give a failed post a fresh retry budget
    release  Queue a draft
    recover  Return posts stuck in 'processing' to the queue
    stats    Count posts by status

USAGE EXAMPLES:
    # Post to two platforms now
    fan-queue add \"Hello fediverse\" -p mastodon -p nostr

    # Schedule for later
    fan-queue add \"Launch day!\" -p mastodon --at \"tomorrow 9am\" --tag launch

    # List failed posts as JSON
    fan-queue list --status failed --format json

    # Retry a failed post
    fan-queue reset <POST_ID>

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location:  ~/.local/share/fanout/queue.db

    Override with environment variables:
        FANOUT_CONFIG    - Path to config file
        FANOUT_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Configuration error
    3 - Invalid input (bad post ID, time format, transition, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a new post
    Add {
        /// Post text
        text: String,

        /// Platform to publish to (repeatable)
        #[arg(short, long = "platform", value_name = "PLATFORM")]
        platforms: Vec<String>,

        /// Media attachment as KIND=URL, KIND is image or video (repeatable)
        #[arg(short, long, value_name = "KIND=URL")]
        media: Vec<String>,

        /// Hashtag (repeatable)
        #[arg(short, long = "tag", value_name = "TAG")]
        tags: Vec<String>,

        /// When to publish: "30m", "tomorrow 3pm" or an RFC 3339 time
        #[arg(long, value_name = "WHEN")]
        at: Option<String>,

        /// Repeat hourly, daily, weekly or monthly
        #[arg(long, value_name = "FREQUENCY")]
        every: Option<String>,

        /// Stop a recurring post after this many occurrences
        #[arg(long, value_name = "N", requires = "every")]
        times: Option<u32>,

        /// urgent, high, normal or low
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Retry limit for this post (at most 10)
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,

        /// Owning tenant
        #[arg(long, env = "FANOUT_OWNER", default_value = "default")]
        owner: String,

        /// Save as a draft instead of queueing
        #[arg(long)]
        draft: bool,
    },

    /// List posts, newest first
    List {
        /// Only posts in this status
        #[arg(short, long)]
        status: Option<String>,

        /// Only posts of this owner
        #[arg(long)]
        owner: Option<String>,

        /// Show at most this many posts
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show a post in detail
    Show { post_id: String },

    /// Cancel a post
    Cancel { post_id: String },

    /// Move a failed post back to pending with its retry count cleared
    Reset { post_id: String },

    /// Queue a draft
    Release { post_id: String },

    /// Return posts stuck in processing to the queue
    Recover {
        /// Claims older than this are recovered (default: dispatcher.stale_after)
        #[arg(long, value_name = "DURATION")]
        older_than: Option<String>,
    },

    /// Count posts by status
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, "warn".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<FanoutError>()
            .map_or(1, FanoutError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let service = QueueService::new(Arc::new(db), config.retry.clone());
    let format = cli.format;
    let now = Utc::now();

    match cli.command {
        Commands::Add {
            text,
            platforms,
            media,
            tags,
            at,
            every,
            times,
            priority,
            max_retries,
            owner,
            draft,
        } => {
            let request = NewPost {
                owner,
                text,
                media: parse_media(&media)?,
                hashtags: tags,
                platforms,
                schedule: parse_schedule_request(at.as_deref(), every.as_deref(), times, now)?,
                priority: priority.parse::<Priority>()?,
                max_retries,
                draft,
            };
            let post = service.create(request, now).await?;
            match format {
                OutputFormat::Json => print_json(&post)?,
                OutputFormat::Text => println!("{}", post.id),
            }
        }

        Commands::List {
            status,
            owner,
            limit,
        } => {
            let filter = PostFilter {
                status: status.as_deref().map(str::parse::<PostStatus>).transpose()?,
                owner,
                limit,
            };
            let posts = service.list(&filter).await?;
            match format {
                OutputFormat::Json => print_json(&posts)?,
                OutputFormat::Text => output_list_text(&posts, now),
            }
        }

        Commands::Show { post_id } => {
            let post = service.get(&post_id).await?;
            match format {
                OutputFormat::Json => print_json(&post)?,
                OutputFormat::Text => output_post_text(&post),
            }
        }

        Commands::Cancel { post_id } => {
            let outcome = service.cancel(&post_id, now).await?;
            match (format, &outcome) {
                (OutputFormat::Json, _) => print_json(&outcome)?,
                (OutputFormat::Text, CancelOutcome::Cancelled { post }) => {
                    println!("Cancelled post {}", post.id)
                }
                (OutputFormat::Text, CancelOutcome::Deferred { post_id }) => println!(
                    "Post {} is being published; it will be cancelled when the current attempt finishes",
                    post_id
                ),
            }
        }

        Commands::Reset { post_id } => {
            let post = service.reset_retries(&post_id, now).await?;
            match format {
                OutputFormat::Json => print_json(&post)?,
                OutputFormat::Text => println!("Reset retries for post {}", post.id),
            }
        }

        Commands::Release { post_id } => {
            let post = service.queue(&post_id, now).await?;
            match format {
                OutputFormat::Json => print_json(&post)?,
                OutputFormat::Text => println!("Queued post {} ({})", post.id, post.status),
            }
        }

        Commands::Recover { older_than } => {
            let age = match older_than {
                Some(raw) => parse_duration(&raw)?,
                None => chrono::Duration::from_std(config.dispatcher.stale_after).map_err(|_| {
                    FanoutError::InvalidInput("dispatcher.stale_after out of range".to_string())
                })?,
            };
            let cutoff = now.checked_sub_signed(age).ok_or_else(|| {
                FanoutError::InvalidInput("--older-than is out of range".to_string())
            })?;
            let recovered = service.recover_stale(cutoff, now).await?;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({ "recovered": recovered }))?,
                OutputFormat::Text => {
                    println!("Recovered {} post(s)", recovered.len());
                    for id in &recovered {
                        println!("{}", id);
                    }
                }
            }
        }

        Commands::Stats => {
            let counts = service.stats().await?;
            match format {
                OutputFormat::Json => print_json(&counts)?,
                OutputFormat::Text => output_stats_text(&counts),
            }
        }
    }

    Ok(())
}

fn parse_schedule_request(
    at: Option<&str>,
    every: Option<&str>,
    times: Option<u32>,
    now: DateTime<Utc>,
) -> libfanout::Result<ScheduleRequest> {
    let when = at.map(|raw| parse_schedule(raw, now)).transpose()?;

    match every {
        Some(raw) => Ok(ScheduleRequest::Recurring {
            first: when.unwrap_or(now),
            frequency: raw.parse::<Frequency>()?,
            max_occurrences: times,
        }),
        None => Ok(when.map_or(ScheduleRequest::Immediate, ScheduleRequest::At)),
    }
}

/// Parse `KIND=URL` media arguments
fn parse_media(args: &[String]) -> libfanout::Result<Vec<MediaAttachment>> {
    args.iter()
        .map(|arg| {
            let (kind, url) = arg.split_once('=').ok_or_else(|| {
                FanoutError::InvalidInput(format!(
                    "Media must be given as KIND=URL (e.g. image=https://...), got '{}'",
                    arg
                ))
            })?;
            Ok(MediaAttachment::new(kind.parse::<MediaKind>()?, url))
        })
        .collect()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn output_list_text(posts: &[Post], now: DateTime<Utc>) {
    for post in posts {
        println!(
            "{} | {} | {} | {} | {}",
            post.id,
            post.status,
            post.priority,
            format_when(post.schedule.target_time, now),
            truncate_content(&post.content.text, 50)
        );
    }
}

fn output_post_text(post: &Post) {
    println!("ID:        {}", post.id);
    println!("Owner:     {}", post.owner);
    println!("Status:    {}", post.status);
    println!("Priority:  {}", post.priority);
    println!(
        "Schedule:  {} at {}",
        post.schedule.kind.as_str(),
        post.schedule.target_time.to_rfc3339()
    );
    println!("Retries:   {}/{}", post.retry.count, post.retry.max_retries);
    if let Some(next) = post.retry.next_retry_at {
        println!("Next try:  {}", next.to_rfc3339());
    }
    println!("Content:   {}", post.content.render_text());

    println!("Platforms:");
    for (name, state) in &post.platform_targets {
        let summary = if !state.enabled {
            "disabled".to_string()
        } else if state.posted {
            format!("posted {}", state.post_url.as_deref().unwrap_or(""))
        } else {
            match &state.last_error {
                Some(error) => format!("not posted ({} attempts): {}", state.attempt_count, error),
                None => format!("not posted ({} attempts)", state.attempt_count),
            }
        };
        println!("  {}: {}", name, summary);
    }

    if !post.errors.is_empty() {
        println!("Errors:");
        for entry in &post.errors {
            println!(
                "  {} [{}] {}",
                entry.timestamp.to_rfc3339(),
                entry.platform.as_deref().unwrap_or("-"),
                entry.message
            );
        }
    }
}

fn output_stats_text(counts: &StatusCounts) {
    for status in PostStatus::ALL {
        println!("{:<11} {}", format!("{}:", status), counts.get(status));
    }
    println!("{:<11} {}", "total:", counts.total());
}

/// Truncate content to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// "in 2 hours", "5 minutes ago"
fn format_when(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = (at - now).num_seconds();
    let magnitude = diff.unsigned_abs();

    let (value, unit) = if magnitude >= 86_400 {
        (magnitude / 86_400, "day")
    } else if magnitude >= 3_600 {
        (magnitude / 3_600, "hour")
    } else if magnitude >= 60 {
        (magnitude / 60, "minute")
    } else {
        return "now".to_string();
    };

    let plural = if value == 1 { "" } else { "s" };
    if diff > 0 {
        format!("in {} {}{}", value, unit, plural)
    } else {
        format!("{} {}{} ago", value, unit, plural)
    }
}
