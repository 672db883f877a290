use clap::{Parser, Subcommand};
use engine::message::{Message, Role};
use engine::upload::{UploadFile, UploadPhase};
use engine::Engine;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "moyo")]
#[command(about = "Moyo chat client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Chat with the assistant (interactive). Replies stream in as they are generated.
    Chat {
        /// Config file path (default: MOYO_CONFIG_PATH or ~/.moyo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Session id to register (default: MOYO_SESSION_ID, or derived from the token).
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Bearer token from the auth service (default: MOYO_AUTH_TOKEN).
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("moyo {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Chat {
            config,
            session,
            token,
        }) => {
            if let Err(e) = run_chat(config, session, token).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_chat(
    config_path: Option<PathBuf>,
    session: Option<String>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let (config, path) = engine::config::load_config(config_path)?;
    log::debug!("config loaded from {}", path.display());
    let session_id = engine::identity::resolve_session_id(session.as_deref(), token.as_deref())?;
    let bearer = engine::identity::resolve_token(token.as_deref());

    let engine = Engine::from_config(&config, session_id, bearer);
    engine.connect().await?;
    println!(
        "connected as {} (/attach PATH, /send, /notices, /dismiss ID, /quit)",
        engine.session_id()
    );

    let printer = tokio::spawn(print_conversation(
        engine.store().clone(),
        engine.notifications().clone(),
        engine.uploads().watch(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut staged: Option<UploadFile> = None;
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/quit") || input.eq_ignore_ascii_case("/exit") {
            break;
        }
        if let Some(path) = input.strip_prefix("/attach ") {
            let limit = engine.uploads().limits().max_file_bytes;
            match UploadFile::from_path(std::path::Path::new(path.trim()), limit).await {
                Ok(file) => {
                    println!("[staged {} ({} bytes)]", file.name, file.size());
                    staged = Some(file);
                }
                Err(e) => eprintln!("cannot read {}: {}", path.trim(), e),
            }
            continue;
        }
        if input == "/notices" {
            let active = engine.notifications().active();
            if active.is_empty() {
                println!("[no notices]");
            }
            for n in active {
                println!("[{}] {} ({:?})", n.id, n.title, n.kind);
            }
            continue;
        }
        if let Some(id) = input.strip_prefix("/dismiss ") {
            match id.trim().parse::<u64>() {
                Ok(id) if engine.dismiss(id) => println!("[dismissed {}]", id),
                Ok(id) => println!("[no notice {}]", id),
                Err(_) => eprintln!("usage: /dismiss ID"),
            }
            continue;
        }

        let text = if staged.is_some() && input == "/send" {
            None
        } else {
            Some(input.to_string())
        };
        match engine.submit(text, staged.take()).await {
            Ok(id) => log::debug!("submitted {}", id),
            Err(e) => eprintln!("cannot send: {}", e),
        }
    }

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

/// Echo the conversation as it changes. Streaming replies are printed incrementally.
async fn print_conversation(
    store: std::sync::Arc<engine::store::ConversationStore>,
    notices: std::sync::Arc<engine::notifications::NotificationCenter>,
    mut upload: tokio::sync::watch::Receiver<Option<engine::upload::UploadSession>>,
) {
    let mut rev = store.subscribe();
    let mut notice_rev = notices.subscribe();
    let mut printed = 0usize;
    let mut partial: Option<usize> = None;
    let mut last_notice = 0u64;
    let mut last_phase: Option<UploadPhase> = None;
    loop {
        tokio::select! {
            r = rev.changed() => {
                if r.is_err() {
                    return;
                }
                let msgs = store.snapshot().await;
                if msgs.len() < printed {
                    // History was replaced by a shorter snapshot.
                    printed = 0;
                    partial = None;
                }
                while let Some(m) = msgs.get(printed) {
                    if !print_message(m, &mut partial) {
                        break;
                    }
                    printed += 1;
                }
            }
            r = notice_rev.changed() => {
                if r.is_err() {
                    return;
                }
                for n in notices.active().into_iter().rev() {
                    if n.id > last_notice {
                        println!("\n[notice {}] {}", n.id, n.title);
                        last_notice = n.id;
                    }
                }
            }
            r = upload.changed() => {
                if r.is_err() {
                    return;
                }
                let session = upload.borrow_and_update().clone();
                if let Some(s) = session {
                    if s.file_ref.is_some() && s.phase == UploadPhase::Uploading {
                        println!("[upload {}%]", s.progress_percent);
                    }
                    if Some(s.phase) != last_phase && s.phase == UploadPhase::Failed {
                        match &s.failure {
                            Some(e) => println!("[upload failed: {}]", e),
                            None => println!("[upload cancelled]"),
                        }
                    }
                    last_phase = Some(s.phase);
                }
            }
        }
    }
}

/// Print what is new in `m`. Returns true once the message is complete.
fn print_message(m: &Message, partial: &mut Option<usize>) -> bool {
    use std::io::Write;

    if m.role == Role::User && m.local {
        return true;
    }
    let from = match *partial {
        Some(n) => n,
        None => {
            match m.role {
                Role::User => print!("> "),
                Role::Assistant => print!("< "),
            }
            0
        }
    };
    if let Some(rest) = m.content.get(from..) {
        print!("{}", rest);
    }
    let _ = std::io::stdout().flush();
    if m.streaming {
        *partial = Some(m.content.len());
        return false;
    }
    println!();
    *partial = None;
    true
}
