//! agora — operator CLI for the debate engine
//!
//! # Usage
//!
//! ```bash
//! # Check a debate file (and its credential variables)
//! agora validate debate.toml --check-credentials
//!
//! # Worst-case cost if every round runs
//! agora estimate debate.toml --avg-input-tokens 3000
//!
//! # Run the real engine against canned answers, events as JSON lines
//! RUST_LOG=agora_coordination=debug agora rehearse debate.toml --script script.toml
//! ```

mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use agora_coordination::cost::{
    estimate_debate_cost, total_cost, CostEstimate, DEFAULT_AVG_INPUT_TOKENS,
    DEFAULT_AVG_OUTPUT_TOKENS,
};
use agora_coordination::events::{EventBusError, EventBusExt, EventFilter};
use agora_coordination::{DebateConfig, DebateEngine, DebateEvent, EngineConfig};

use script::{Script, ScriptedAgent};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "agora", author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a debate file
    Validate {
        debate: PathBuf,
        /// Also require every `credential_env` variable to be set
        #[arg(long, default_value_t = false)]
        check_credentials: bool,
    },
    /// Estimate the cost of a debate that runs all its rounds
    Estimate {
        debate: PathBuf,
        /// Average prompt tokens per turn
        #[arg(long, default_value_t = DEFAULT_AVG_INPUT_TOKENS)]
        avg_input_tokens: u64,
        /// Average completion tokens per turn
        #[arg(long, default_value_t = DEFAULT_AVG_OUTPUT_TOKENS)]
        avg_output_tokens: u64,
    },
    /// Run a debate against a scripted capability
    Rehearse {
        debate: PathBuf,
        /// Script with canned turns, judgments and conspectus
        #[arg(long)]
        script: PathBuf,
        /// Leave out turn_appended / conspectus_appended events
        #[arg(long, default_value_t = false)]
        no_fragments: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Validate {
            debate,
            check_credentials,
        } => {
            let mut config = load_debate(&debate)?;
            if check_credentials {
                config
                    .bind_credentials_from_env()
                    .context("credential check failed")?;
            }
            print!("{}", render_summary(&config));
        }
        Command::Estimate {
            debate,
            avg_input_tokens,
            avg_output_tokens,
        } => {
            let config = load_debate(&debate)?;
            let estimates = estimate_debate_cost(
                &config.participants,
                config.max_rounds,
                avg_input_tokens,
                avg_output_tokens,
            );
            print!("{}", render_estimate(&estimates));
        }
        Command::Rehearse {
            debate,
            script,
            no_fragments,
        } => rehearse(&debate, &script, no_fragments).await?,
    }

    Ok(())
}

/// Load and validate a debate file.
fn load_debate(path: &Path) -> Result<DebateConfig> {
    let config = DebateConfig::load(path)
        .with_context(|| format!("failed to load debate file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid debate file {}", path.display()))?;
    Ok(config)
}

fn render_summary(config: &DebateConfig) -> String {
    let moderator = config.moderator_index();
    let mut out = format!(
        "topic:      {}\nmax rounds: {}\nturn limit: {} tokens\nthreshold:  {:.2}\nparticipants:\n",
        config.topic.trim(),
        config.max_rounds,
        config.max_tokens_per_turn,
        config.consensus_threshold
    );
    for (i, p) in config.participants.iter().enumerate() {
        let marker = if i == moderator { " (moderator)" } else { "" };
        out.push_str(&format!(
            "  {}. {} [{}/{}]{}\n",
            i + 1,
            p.display_name,
            p.provider,
            p.model,
            marker
        ));
    }
    out
}

fn render_estimate(estimates: &[CostEstimate]) -> String {
    let mut out = String::new();
    for e in estimates {
        let price = if e.priced {
            format!("${:.4}", e.usd)
        } else {
            "unpriced".to_string()
        };
        out.push_str(&format!(
            "{:<16} {:<28} {:>3} turns {:>9} in {:>9} out  {}\n",
            e.participant, e.model, e.turns, e.input_tokens, e.output_tokens, price
        ));
    }
    out.push_str(&format!("total: ${:.4}\n", total_cost(estimates)));
    out
}

fn print_event(event: &DebateEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn rehearse(debate: &Path, script: &Path, no_fragments: bool) -> Result<()> {
    let config = load_debate(debate)?;
    let script = Script::load(script)?;
    let engine_config = EngineConfig::from_env().context("invalid AGORA_* environment")?;

    let engine = DebateEngine::new(Arc::new(ScriptedAgent::new(script)), engine_config);
    let filter = if no_fragments {
        EventFilter::new().types(vec![
            "status_changed",
            "debate_started",
            "round_started",
            "turn_opened",
            "turn_frozen",
            "consensus_checked",
            "concluded",
            "conspectus_started",
            "conspectus_ready",
            "conspectus_failed",
            "failed",
        ])
    } else {
        EventFilter::new()
    };
    let mut events = engine.events().subscribe_filtered(filter);

    let session_id = engine.start(config)?;
    info!(session_id = %session_id, "Rehearsal started");

    let finished = engine.wait();
    tokio::pin!(finished);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event)?;
                    if event.kind.is_final() {
                        break;
                    }
                }
                Err(EventBusError::ChannelClosed) => break,
            },
            signal = &mut ctrl_c, if !interrupted => {
                signal.context("failed to listen for ctrl-c")?;
                interrupted = true;
                if let Err(e) = engine.stop() {
                    warn!(error = %e, "Stop ignored");
                }
            }
            _ = &mut finished => break,
        }
    }

    // Finish the task, then flush whatever it published after the last recv.
    engine.wait().await;
    while let Some(event) = events.try_recv() {
        print_event(&event)?;
    }

    let session = engine.snapshot();
    info!(summary = %session.status_line(), "Rehearsal finished");
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DEBATE: &str = r#"
topic = "Is virtue teachable?"
max_rounds = 3
moderator = 1

[[participants]]
provider = "anthropic"
model = "claude-sonnet-4-20250514"
display_name = "Socrates"

[[participants]]
provider = "openai"
model = "gpt-4o"
display_name = "Meno"
"#;

    fn debate_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from(["agora", "estimate", "d.toml", "--avg-input-tokens", "10"])
            .unwrap();
        match args.command {
            Command::Estimate {
                avg_input_tokens,
                avg_output_tokens,
                ..
            } => {
                assert_eq!(avg_input_tokens, 10);
                assert_eq!(avg_output_tokens, DEFAULT_AVG_OUTPUT_TOKENS);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Args::try_parse_from(["agora", "rehearse", "d.toml"]).is_err());
    }

    #[test]
    fn test_load_and_summarise() {
        let file = debate_file(DEBATE);
        let config = load_debate(file.path()).unwrap();
        let summary = render_summary(&config);
        assert!(summary.starts_with(
            "topic:      Is virtue teachable?\nmax rounds: 3\nturn limit: 1024 tokens\nthreshold:  0.80\nparticipants:\n"
        ));
        assert_eq!(summary.lines().count(), 7);
        assert!(summary.contains("2. Meno [openai/gpt-4o] (moderator)"));
        assert!(!summary.contains("Socrates [anthropic/claude-sonnet-4-20250514] (moderator)"));
    }

    #[test]
    fn test_invalid_debate_file_is_rejected() {
        let file = debate_file(&DEBATE.replace("max_rounds = 3", "max_rounds = 0"));
        let err = load_debate(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("max_rounds"));

        let err = load_debate(Path::new("/nonexistent/debate.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to load debate file"));
    }

    #[test]
    fn test_estimate_rendering() {
        let file = debate_file(DEBATE);
        let config = load_debate(file.path()).unwrap();
        let estimates = estimate_debate_cost(&config.participants, config.max_rounds, 2000, 500);
        let rendered = render_estimate(&estimates);
        // Socrates: 6k in * $3/M + 1.5k out * $15/M = 0.0405
        assert!(rendered.contains("$0.0405"));
        assert!(rendered.lines().last().unwrap().starts_with("total: $"));
    }
}
