//! Terminal practice client.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use articulotor::api::{
    ApiClient, ApiError, CreateSessionRequest, Dashboard, FeedbackReport, SessionMode,
};
use articulotor::audio::console::{ConsoleCapture, ConsolePlayback, TypedSpeech};
use articulotor::config::ClientConfig;
use articulotor::session::protocol::DEFAULT_OPENING;
use articulotor::session::{
    ConnectionState, Intent, SessionEvent, SessionExit, SessionRunner, SessionSnapshot, TurnDevices,
    TurnState,
};

/// Articulotor - practice conversations with an AI persona
#[derive(Parser, Debug)]
#[command(name = "articulotor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the backend API origin
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Increase logging verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List practice scenarios
    Scenarios {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        difficulty: Option<String>,
    },
    /// Have the backend write a custom scenario from a description
    Generate {
        /// What to practice, at least 10 characters
        #[arg(long)]
        prompt: String,
    },
    /// List personas
    Personas,
    /// Live session over the session socket; typed lines stand in for speech
    Practice {
        #[arg(long)]
        scenario: String,
        #[arg(long, value_enum, default_value_t = LiveMode::Voice)]
        mode: LiveMode,
        #[arg(long)]
        persona: Option<String>,
        /// Hold-to-talk: a typed line opens the turn and silence submits it
        #[arg(long)]
        hold: bool,
    },
    /// Text-mode session over the chat endpoint
    Chat {
        #[arg(long)]
        scenario: String,
        #[arg(long)]
        persona: Option<String>,
    },
    /// Print the feedback report of an ended session
    Feedback { session_id: String },
    /// Progress across all ended sessions
    Dashboard,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LiveMode {
    Voice,
    Camera,
}

impl From<LiveMode> for SessionMode {
    fn from(mode: LiveMode) -> Self {
        match mode {
            LiveMode::Voice => SessionMode::Voice,
            LiveMode::Camera => SessionMode::Camera,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "articulotor=info",
        1 => "articulotor=debug",
        _ => "articulotor=trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ClientConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.api_url {
        config.api_url = url;
        config.validate()?;
    }
    let api = ApiClient::new(&config)?;

    match cli.command {
        Commands::Scenarios {
            category,
            difficulty,
        } => list_scenarios(&api, category.as_deref(), difficulty.as_deref()).await,
        Commands::Generate { prompt } => generate_scenario(&api, &prompt).await,
        Commands::Personas => list_personas(&api).await,
        Commands::Practice {
            scenario,
            mode,
            persona,
            hold,
        } => practice(api, &config, scenario, mode.into(), persona, hold).await,
        Commands::Chat { scenario, persona } => chat(&api, scenario, persona).await,
        Commands::Feedback { session_id } => show_feedback(&api, &session_id).await,
        Commands::Dashboard => show_dashboard(&api).await,
    }
}

// ── Catalogue ─────────────────────────────────────────────────────

async fn list_scenarios(
    api: &ApiClient,
    category: Option<&str>,
    difficulty: Option<&str>,
) -> Result<()> {
    let scenarios = api.list_scenarios(category, difficulty).await?;
    if scenarios.is_empty() {
        println!("No scenarios match.");
    }
    for s in scenarios {
        println!(
            "{:<28} {:<7} {:<20} {}",
            s.id, s.difficulty, s.category, s.title
        );
    }
    Ok(())
}

async fn generate_scenario(api: &ApiClient, prompt: &str) -> Result<()> {
    let scenario = api
        .generate_scenario(prompt)
        .await
        .context("generating scenario")?;
    println!("{} ({}, {})", scenario.title, scenario.category, scenario.difficulty);
    println!("  id:      {}", scenario.id);
    println!("  role:    {}", scenario.role);
    println!("  context: {}", scenario.context);
    if let Some(opening) = &scenario.opening {
        println!("  opening: {opening}");
    }
    println!("\nStart it with: articulotor practice --scenario {}", scenario.id);
    Ok(())
}

async fn list_personas(api: &ApiClient) -> Result<()> {
    for (key, persona) in api.list_personas().await? {
        println!("{key:<12} {} - {}", persona.name, persona.style);
    }
    Ok(())
}

// ── Live practice ─────────────────────────────────────────────────

async fn practice(
    api: ApiClient,
    config: &ClientConfig,
    scenario_id: String,
    mode: SessionMode,
    persona: Option<String>,
    hold: bool,
) -> Result<()> {
    let created = api
        .create_session(&CreateSessionRequest {
            scenario_id,
            mode,
            persona,
        })
        .await
        .context("creating session")?;

    println!("{} ({})", created.scenario.title, created.scenario.role);
    println!("{}\n", created.scenario.context);
    if hold {
        println!("Type what you would say; the turn submits after a pause.");
    } else {
        println!("Type what you would say and press enter to submit.");
    }
    println!("Commands: /silent  /end  /retry  /quit\n");

    let speech = Arc::new(TypedSpeech::new());
    let devices = TurnDevices {
        capture: Arc::new(ConsoleCapture::new()),
        recognizer: speech.clone(),
        playback: Arc::new(ConsolePlayback::default()),
    };
    let api = Arc::new(api);
    let session_id = created.session_id.clone();
    let (runner, mut handle) =
        SessionRunner::new(config, session_id.clone(), mode, devices, api.clone());
    let runner_task = tokio::spawn(runner.run());
    let input = tokio::spawn(read_turns(speech, handle.intent_sender(), hold));

    let mut snapshots = handle.subscribe();
    let mut last = handle.snapshot();
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(SessionEvent::ConfirmEndRequired) => {
                    println!("A turn is still in progress. Type /end! to end anyway.");
                }
                Some(SessionEvent::CaptureFailed(e)) => eprintln!("Could not start the turn: {e}"),
                Some(SessionEvent::EndFailed { reason, notified }) => {
                    eprintln!("Could not end the session: {reason}");
                    if notified {
                        println!("The server was told to end the session and should confirm shortly.");
                    } else {
                        println!("The session is still open. Type /end to try again.");
                    }
                }
                Some(SessionEvent::Ended { by_server }) => {
                    if by_server {
                        println!("The session was closed by the server.");
                    }
                    break;
                }
                Some(SessionEvent::Left) | None => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                report_changes(&last, &snapshot);
                last = snapshot;
            }
        }
    }

    input.abort();
    let exit = runner_task.await.context("session runner panicked")??;
    if let SessionExit::Ended { .. } = exit {
        show_feedback(&api, &session_id).await?;
    } else {
        println!("Left session {session_id}.");
    }
    Ok(())
}

fn report_changes(previous: &SessionSnapshot, current: &SessionSnapshot) {
    if previous.connection != current.connection {
        match current.connection {
            ConnectionState::Reconnecting { attempt, delay_ms } => {
                println!("  [connection lost, retry {attempt} in {delay_ms} ms]");
            }
            ConnectionState::Failed => {
                println!("  [could not reconnect; type /retry to try again]");
            }
            ConnectionState::Connected => println!("  [connected]"),
            _ => {}
        }
    }
    if previous.server_notice != current.server_notice {
        if let Some(notice) = &current.server_notice {
            println!("  [server: {notice}]");
        }
    }
    if current.turn != previous.turn {
        if let TurnState::Processing { delivered: false } = current.turn {
            println!("  [not connected, that turn was not delivered]");
        }
    }
}

/// Typed lines become turns: queued as recognizer output, then the talk
/// control is operated the way a user would.
async fn read_turns(
    speech: Arc<TypedSpeech>,
    intents: mpsc::UnboundedSender<Intent>,
    hold: bool,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match line.trim() {
            "" => continue,
            "/end" => intents.send(Intent::EndSession { confirmed: false }).is_ok(),
            "/end!" => intents.send(Intent::EndSession { confirmed: true }).is_ok(),
            "/retry" => intents.send(Intent::Retry).is_ok(),
            "/quit" => intents.send(Intent::Leave).is_ok(),
            text => {
                if text != "/silent" {
                    speech.queue(text);
                }
                if hold {
                    intents.send(Intent::Press).is_ok()
                } else {
                    intents.send(Intent::Toggle).is_ok() && intents.send(Intent::Toggle).is_ok()
                }
            }
        };
        if !sent {
            return Ok(());
        }
    }
    let _ = intents.send(Intent::Leave);
    Ok(())
}

// ── Text chat ─────────────────────────────────────────────────────

async fn chat(api: &ApiClient, scenario_id: String, persona: Option<String>) -> Result<()> {
    let created = api
        .create_session(&CreateSessionRequest {
            scenario_id,
            mode: SessionMode::Chat,
            persona,
        })
        .await
        .context("creating session")?;
    let session_id = created.session_id;

    println!("{} ({})", created.scenario.title, created.scenario.role);
    println!("Type /end to finish.\n");
    println!(
        "  persona> {}\n",
        created.scenario.opening.as_deref().unwrap_or(DEFAULT_OPENING)
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/end" {
            break;
        }
        match api.send_chat_message(&session_id, message).await {
            Ok(reply) => {
                println!("\n  persona> {}\n", reply.response.unwrap_or_default());
                if let Some(analysis) = reply.analysis {
                    if !analysis.filler_words.is_empty() {
                        println!("  [filler words: {}]", analysis.filler_words.join(", "));
                    }
                }
            }
            Err(e) => eprintln!("Message not sent: {e}"),
        }
    }

    api.end_session(&session_id).await?;
    show_feedback(api, &session_id).await
}

// ── Feedback ──────────────────────────────────────────────────────

async fn show_feedback(api: &ApiClient, session_id: &str) -> Result<()> {
    match api.get_feedback(session_id).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(ApiError::Unavailable(reason)) => {
            println!("No feedback yet: {reason}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &FeedbackReport) {
    let s = &report.sub_scores;
    println!("\nOverall score: {}/100 over {} turns", report.overall_score, report.turn_count);
    println!(
        "  clarity {}  structure {}  persuasiveness {}  vocabulary {}",
        s.clarity, s.structure, s.persuasiveness, s.vocabulary
    );
    if !report.filler_words.is_empty() {
        println!("Filler words ({}): {}", report.filler_words.len(), report.filler_words.join(", "));
    }
    for strength in &report.strengths {
        println!("  + {strength}");
    }
    for improvement in &report.improvements {
        println!("  - {improvement}");
    }
    if !report.closing_message.is_empty() {
        println!("\n{}", report.closing_message);
    }
}

// ── Dashboard ─────────────────────────────────────────────────────

async fn show_dashboard(api: &ApiClient) -> Result<()> {
    let dashboard = api.get_dashboard().await?;
    print_dashboard(&dashboard);
    Ok(())
}

fn print_dashboard(dashboard: &Dashboard) {
    if dashboard.total_sessions == 0 {
        println!("No completed sessions yet.");
        return;
    }
    let s = &dashboard.skill_progression;
    println!(
        "{} sessions, average score {}/100, streak {} day(s), ~{:.1} h spoken",
        dashboard.total_sessions,
        dashboard.avg_score,
        dashboard.current_streak,
        dashboard.total_hours_spoken
    );
    println!(
        "  clarity {}  structure {}  persuasiveness {}  vocabulary {}",
        s.clarity, s.structure, s.persuasiveness, s.vocabulary
    );
    if dashboard.filler_word_trend != 0 {
        println!("Filler words {:+}% versus earlier sessions", dashboard.filler_word_trend);
    }
    let crutch: Vec<String> = dashboard
        .top_crutch_words(5)
        .into_iter()
        .map(|(word, count)| format!("{word} x{count}"))
        .collect();
    if !crutch.is_empty() {
        println!("Crutch words: {}", crutch.join(", "));
    }
    for session in &dashboard.recent_sessions {
        println!(
            "  {:<10} {:<28} {:>3}/100  {} turns  {:.1} min",
            session.id, session.scenario_id, session.score, session.turns, session.duration_minutes
        );
    }
}
