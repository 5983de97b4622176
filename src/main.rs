//! safespace: terminal front end for the chat service.
//!
//! Fetches the model weights if needed, loads them, and runs a line-oriented
//! chat loop on stdin. Lines starting with `/` are commands, anything else is
//! sent to the model.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::info;

use safespace::chat::service::{ChatHandle, ChatService, VerbOutcome};
use safespace::config::{Cli, Config};
use safespace::download::manager::{DownloadManager, DownloadState};
use safespace::download::source::{HttpSource, TransferSource};
use safespace::inference::llama::LlamaBackend;
use safespace::inference::session::ModelSession;

const HELP: &str = "\
Commands:
  /history         show the conversation with turn numbers
  /continue <n>    keep generating the answer at turn <n>
  /regenerate <n>  write a new answer at turn <n>
  /copy [n]        print turn <n>, or the whole conversation
  /clear           start over
  /quit            exit
Ctrl-C while an answer is streaming stops it; at the prompt it exits.";

enum Input {
    Ask(String),
    Continue(usize),
    Regenerate(usize),
    Copy(Option<usize>),
    History,
    Clear,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Ask(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let index = parts.next().map(|n| n.parse::<usize>());

    match (name, index) {
        ("continue", Some(Ok(n))) => Ok(Input::Continue(n)),
        ("regenerate", Some(Ok(n))) => Ok(Input::Regenerate(n)),
        ("copy", None) => Ok(Input::Copy(None)),
        ("copy", Some(Ok(n))) => Ok(Input::Copy(Some(n))),
        ("history", None) => Ok(Input::History),
        ("clear", None) => Ok(Input::Clear),
        ("help", _) => Ok(Input::Help),
        ("quit" | "exit", None) => Ok(Input::Quit),
        (_, Some(Err(_))) => Err("expected a turn number".to_string()),
        _ => Err(format!("unknown command /{command}, try /help")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "safespace=debug"
    } else {
        "safespace=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("safespace v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let model_path = config.download.model_path();

    info!(
        model = %model_path.display(),
        template = ?config.chat.template,
        max_output_chars = config.chat.max_output_chars,
        "Configuration loaded"
    );

    // Make sure the weights are on disk.
    let downloads = DownloadManager::from_config(&config.download);
    if cli.skip_download {
        if !matches!(downloads.status(&model_path).await, DownloadState::Complete { .. }) {
            bail!("Model not found at {}", model_path.display());
        }
    } else {
        let source: Arc<dyn TransferSource> = Arc::new(HttpSource::new(&config.download.url));
        let mut progress = downloads.acquire(source, model_path.clone(), |path| {
            info!(path = %path.display(), "Model available");
        });

        while let Some(state) = progress.next().await {
            match state {
                DownloadState::InProgress { .. } => {
                    eprint!("\rDownloading model: {:>3}%", (state.progress() * 100.0) as u32);
                }
                DownloadState::Complete { .. } => eprintln!(),
                DownloadState::Failed(reason) => {
                    eprintln!();
                    bail!("Download failed: {reason}");
                }
                DownloadState::Absent => {}
            }
        }
    }

    // Start the chat service and load the model.
    let session = ModelSession::new(Box::new(LlamaBackend::new()), &config);
    let chat = ChatService::spawn(session, &config);

    chat.load_model(model_path.clone()).await?;
    let status = chat.status();
    if let Some(err) = status.last_error {
        bail!(err);
    }

    println!("Model loaded. Type a message, or /help for commands.");
    let mut interrupts = forward_interrupts();
    chat_loop(&chat, BufReader::new(tokio::io::stdin()), &mut interrupts).await
}

/// Install the Ctrl-C handler once and turn each signal into a message.
fn forward_interrupts() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn chat_loop<R>(
    chat: &ChatHandle,
    input: R,
    interrupts: &mut mpsc::Receiver<()>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = interrupts.recv() => {
                println!();
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(msg) => {
                eprintln!("{msg}");
                continue;
            }
        };

        let (outcome, target, already_printed) = match input {
            Input::Ask(text) => {
                let target = chat.transcript().len() + 1;
                (chat.ask(text).await?, target, 0)
            }
            Input::Continue(n) => {
                let printed = chat.copy_turn(n).map(|c| c.len()).unwrap_or(0);
                (chat.continue_generating(n).await?, n, printed)
            }
            Input::Regenerate(n) => (chat.regenerate(n).await?, n, 0),
            Input::Copy(Some(n)) => {
                match chat.copy_turn(n) {
                    Some(text) => println!("{text}"),
                    None => eprintln!("no turn {n}"),
                }
                continue;
            }
            Input::Copy(None) => {
                let transcript = chat.transcript();
                println!("{}", transcript.copy_text(0..transcript.len()));
                continue;
            }
            Input::History => {
                for (i, turn) in chat.transcript().turns().iter().enumerate() {
                    println!("[{i}] {}: {}", turn.speaker(), turn.content());
                }
                continue;
            }
            Input::Clear => {
                chat.clear().await?;
                println!("Conversation cleared.");
                continue;
            }
            Input::Help => {
                println!("{HELP}");
                continue;
            }
            Input::Quit => return Ok(()),
        };

        if outcome == VerbOutcome::Ignored {
            eprintln!("(ignored)");
            continue;
        }

        if print_reply(chat, target, already_printed, interrupts).await? == Interrupt::Exit {
            println!();
            return Ok(());
        }

        let status = chat.status();
        if let Some(err) = status.last_error {
            eprintln!("error: {err}");
            chat.dismiss_error().await?;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    None,
    /// Ctrl-C arrived with nothing left to stop.
    Exit,
}

/// Echo the turn at `target` as it grows, until the generation finishes.
async fn print_reply(
    chat: &ChatHandle,
    target: usize,
    mut printed: usize,
    interrupts: &mut mpsc::Receiver<()>,
) -> anyhow::Result<Interrupt> {
    let mut transcript = chat.subscribe_transcript();
    let mut status = chat.subscribe_status();
    let mut stop_sent = false;
    let mut outcome = Interrupt::None;

    loop {
        printed = print_new(&transcript.borrow_and_update(), target, printed)?;
        if !status.borrow_and_update().is_processing {
            break;
        }

        tokio::select! {
            changed = transcript.changed() => if changed.is_err() { break },
            changed = status.changed() => if changed.is_err() { break },
            Some(()) = interrupts.recv() => {
                // Repeated presses while stopping are swallowed.
                if !stop_sent {
                    stop_sent = true;
                    if chat.stop_generating().await? == VerbOutcome::Ignored {
                        outcome = Interrupt::Exit;
                        break;
                    }
                }
            }
        }
    }

    print_new(&transcript.borrow(), target, printed)?;
    println!();
    Ok(outcome)
}

fn print_new(
    transcript: &safespace::chat::transcript::Transcript,
    target: usize,
    printed: usize,
) -> anyhow::Result<usize> {
    let Some(turn) = transcript.get(target).filter(|t| !t.is_user()) else {
        return Ok(printed);
    };
    if let Some(new) = turn.content().get(printed..) {
        print!("{new}");
        std::io::stdout().flush()?;
    }
    Ok(turn.content().len().max(printed))
}
