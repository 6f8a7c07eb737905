use anyhow::Result;
use clap::{Parser, Subcommand};
use spectral_agent::Engine;
use spectral_core::{AppConfig, MemoryKind};
use spectral_llm::HttpLlmClient;
use std::io::{BufRead, Write};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "spectral", about = "AI-driven action assistant", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a single request and print the transcript.
    Run {
        /// The natural-language request.
        text: Vec<String>,
        /// Print chunks as they stream instead of one final block.
        #[arg(long)]
        stream: bool,
    },
    /// Interactive loop; exit with "quit" or Ctrl-D.
    Chat,
    /// Ingest a document into the knowledge store.
    Ingest {
        /// Path of the document to ingest.
        path: std::path::PathBuf,
        /// Memory type: tool_knowledge, task_history, or user_preference.
        #[arg(long, default_value = "tool_knowledge")]
        kind: String,
    },
    /// Show recent conversation memory.
    Memory {
        #[arg(long, default_value_t = 5)]
        turns: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::ensure()?;
    let llm = Arc::new(HttpLlmClient::new(cfg.llm.clone())?);
    let engine = Engine::new(cfg, llm)?;

    match cli.command {
        Command::Run { text, stream } => {
            let text = text.join(" ");
            if stream {
                engine.process_command_stream(&text, &mut |chunk| {
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                });
                println!();
            } else {
                println!("{}", engine.process_command(&text));
            }
        }
        Command::Chat => {
            let stdin = std::io::stdin();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                    break;
                }
                engine.process_command_stream(line, &mut |chunk| {
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                });
                println!();
            }
        }
        Command::Ingest { path, kind } => {
            let kind = MemoryKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("unknown memory type: {kind}"))?;
            let content = std::fs::read_to_string(&path)?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string());
            let chunks = engine.ingest_document(&content, &source, kind)?;
            println!("Ingested {chunks} chunk(s) from {source}");
        }
        Command::Memory { turns } => {
            let context = engine.memory.get_recent_context(turns)?;
            if context.is_empty() {
                println!("No conversation history yet.");
            } else {
                println!("{context}");
            }
        }
    }

    engine.shutdown()?;
    Ok(())
}
