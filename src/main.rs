use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use postpilot::api::{ApiClient, LoginInput, RegisterInput};
use postpilot::calendar::{week_of, Calendar};
use postpilot::gateway::{FileCredentialStore, FilePart, Gateway, ReqwestTransport};
use postpilot::posts::{PostDraft, PostStatus};
use postpilot::timezone::{self, format_in_timezone};
use postpilot::AppConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the backend API, overrides the configured one
    #[arg(long, value_name = "URL", env = "POSTPILOT_API_URL", global = true)]
    api_url: Option<String>,

    /// Timezone used to display and enter times, overrides the configured one
    #[arg(long, value_name = "TZ", global = true)]
    timezone: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "POSTPILOT_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and store the session
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "POSTPILOT_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged in user
    Whoami,
    /// List posts
    Posts {
        /// Only show posts with this status, e.g. `scheduled`
        #[arg(long)]
        status: Option<PostStatus>,
    },
    /// Schedule a post, or save it as draft when no time is given
    Compose {
        /// Text of the post
        content: String,
        /// Local time to publish at, e.g. `2026-10-20T14:30`
        #[arg(long, value_name = "TIME")]
        at: Option<String>,
        /// Image to attach
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
    },
    /// Show the scheduled posts of a week
    Calendar {
        /// Any day of the week to show, defaults to today
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
        /// Keep syncing in the background and redraw the week until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv().ok();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;

    if let Some(api_url) = cli.api_url {
        config.api.base_url = api_url;
    }
    if let Some(timezone) = cli.timezone {
        config.display.timezone = timezone;
    }

    let tz = timezone::parse_timezone(&config.display.timezone)?;
    let client = client(&config)?;

    match cli.command {
        Command::Login { email, password } => {
            let user = client.login(&LoginInput { email, password }).await?;
            println!("Logged in as {} <{}>", user.username, user.email);
        }
        Command::Register {
            email,
            username,
            password,
            name,
        } => {
            let input = RegisterInput {
                email,
                username,
                password,
                timezone: tz.name().to_owned(),
                name,
            };
            let user = client.register(&input).await?;
            println!("Welcome, {}!", user.username);
        }
        Command::Logout => {
            client.logout()?;
            println!("Logged out");
        }
        Command::Whoami => match client.current_user() {
            Some(user) => println!("{} <{}> ({})", user.username, user.email, user.timezone),
            None => println!("Not logged in"),
        },
        Command::Posts { status } => {
            let posts = client.list_posts(status).await?;

            if posts.is_empty() {
                println!("No posts yet");
            }

            for post in posts {
                println!("[{}] {} by {}", post.status, post.id, post.author());
                println!("  {}", post.schedule_label(tz));
                println!("  {}", post.content);
                if let Some(error) = &post.last_error {
                    println!("  last error: {error}");
                }
            }
        }
        Command::Compose { content, at, image } => {
            let mut draft = PostDraft::new(content, tz.name());

            if let Some(at) = at {
                draft = draft.scheduled_at(at);
            }
            if let Some(path) = image {
                draft = draft.image(read_image(&path)?);
            }

            let post = client.create_post(&draft.validate(Utc::now())?).await?;
            println!("Created post {} ({})", post.id, post.schedule_label(tz));
        }
        Command::Calendar { date, watch } => {
            let date = date.unwrap_or_else(|| Utc::now().with_timezone(&tz).date_naive());
            let calendar = Calendar::new(client)?;

            calendar
                .sync_once()
                .await
                .context("failed to fetch scheduled posts")?;
            print_week(&calendar, date, tz).await;

            if watch {
                watch_week(&calendar, date, tz, config.calendar.sync_interval()).await?;
            }
        }
    }

    Ok(())
}

/// Wires the API client to the configured backend and the persisted session.
fn client(config: &AppConfig) -> anyhow::Result<ApiClient> {
    let credentials = Arc::new(FileCredentialStore::open(
        config.session.credentials_path.clone(),
    ));
    let transport = ReqwestTransport::new(config.api.base_url.as_str(), config.api.timeout())?;

    let gateway = Gateway::new(transport, credentials, || {
        eprintln!("Your session has expired. Please run `postpilot login` again.");
    })?
    .with_refresh_timeout(config.api.refresh_timeout());

    Ok(ApiClient::new(gateway))
}

/// Keeps the calendar synced and redraws the week every `period` until Ctrl-C is pressed.
async fn watch_week(
    calendar: &Calendar,
    date: NaiveDate,
    tz: Tz,
    period: Duration,
) -> anyhow::Result<()> {
    let sync_task = calendar.spawn_sync_task(period);
    let mut redraw = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = redraw.tick() => print_week(calendar, date, tz).await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    sync_task.stop().await?;

    Ok(())
}

async fn print_week(calendar: &Calendar, date: NaiveDate, tz: Tz) {
    let week = week_of(date, tz);
    println!(
        "Week of {} ({})",
        week.start.with_timezone(&tz).format("%Y-%m-%d"),
        tz
    );

    let entries_by_day = calendar.entries_by_day(week, tz).await;
    if entries_by_day.is_empty() {
        println!("  nothing scheduled");
    }

    for (day, entries) in entries_by_day {
        println!("{}", day.format("%A, %B %-d"));
        for entry in entries {
            let time = format_in_timezone(&entry.scheduled_at, tz);
            println!("  {time}  [{}] {entry}", entry.status);
        }
    }
}

fn read_image(path: &Path) -> anyhow::Result<FilePart> {
    let mime_type = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => bail!("unsupported image type: {}", path.display()),
    };

    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_owned());

    Ok(FilePart {
        file_name,
        mime_type: mime_type.to_owned(),
        bytes,
    })
}
