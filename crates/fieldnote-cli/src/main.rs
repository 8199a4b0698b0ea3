use std::env;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use fieldnote_contracts::chat::{
    parse_intent, ChatTurn, Intent, Transcript, TurnContent, CHAT_HELP_COMMANDS, IDENTIFY_PROMPT,
};
use fieldnote_contracts::events::{EventLog, EventPayload};
use fieldnote_contracts::gallery::{GalleryEntry, GalleryStore};
use fieldnote_contracts::models::ModelSelector;
use fieldnote_engine::{decode_jpeg, encode_jpeg, fingerprint, CompletionClient};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(
    name = "fieldnote",
    version,
    about = "Photograph an organism, chat with a vision model about it, keep a gallery"
)]
struct Cli {
    /// Gallery backing file.
    #[arg(long, default_value = "gallery_data.json")]
    gallery: PathBuf,
    /// Session event log (JSONL).
    #[arg(long, default_value = "events.jsonl")]
    events: PathBuf,
    /// Vision-capable chat model.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = fieldnote_engine::DEFAULT_MAX_TOKENS)]
    max_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    Bot,
    Gallery,
}

impl Screen {
    fn as_str(self) -> &'static str {
        match self {
            Screen::Bot => "bot",
            Screen::Gallery => "gallery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotPhase {
    AwaitingPhoto,
    Chatting,
}

/// All per-session state, built at startup and rebuilt by `/reset`. The
/// chatting phase is one-way: once a photo is captured the session never
/// returns to awaiting-photo.
#[derive(Debug)]
struct Session {
    transcript: Transcript,
    screen: Screen,
    phase: BotPhase,
    gallery_view: Option<Vec<GalleryEntry>>,
}

impl Session {
    fn new() -> Self {
        Self {
            transcript: Transcript::new(),
            screen: Screen::Bot,
            phase: BotPhase::AwaitingPhoto,
            gallery_view: None,
        }
    }
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("fieldnote error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let api_key = require_api_key()?;

    let selection = ModelSelector::new(None)
        .select(cli.model.as_deref(), "vision")
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = &selection.fallback_reason {
        println!("Using model {}: {reason}", selection.model.name);
    }

    let client = CompletionClient::new(api_key, selection.model.name.clone(), cli.max_tokens);
    let store = GalleryStore::new(&cli.gallery);
    let mut session = Session::new();
    let mut events = EventLog::new(&cli.events, session.transcript.session_id.clone());
    emit_session_started(&events, &session, &client, &store)?;

    println!("Fieldnote started. Type /help for commands.");
    render(&session)?;

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "reset" => {
                session = Session::new();
                events.emit("session_reset", EventPayload::new())?;
                events = EventLog::new(
                    events.path().to_path_buf(),
                    session.transcript.session_id.clone(),
                );
                emit_session_started(&events, &session, &client, &store)?;
                println!("Session reset.");
            }
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            other => {
                // Per-turn failures surface and the loop keeps going; the
                // transcript keeps whatever turns were already appended.
                if let Err(err) = handle_turn(other, &intent, &mut session, &client, &store, &events)
                {
                    eprintln!("fieldnote error: {err:#}");
                }
            }
        }
        render(&session)?;
    }
    Ok(())
}

fn handle_turn(
    action: &str,
    intent: &Intent,
    session: &mut Session,
    client: &CompletionClient,
    store: &GalleryStore,
    events: &EventLog,
) -> Result<()> {
    match action {
        "show_bot" => {
            session.screen = Screen::Bot;
            session.gallery_view = None;
            emit_screen_changed(events, session.screen)?;
        }
        "show_gallery" => {
            session.screen = Screen::Gallery;
            emit_screen_changed(events, session.screen)?;
            let entries = store.fold(&session.transcript)?;
            let mut payload = EventPayload::new();
            payload.insert("entries".to_string(), Value::Number(entries.len().into()));
            payload.insert(
                "described_turns".to_string(),
                Value::Number(session.transcript.described_photos().len().into()),
            );
            events.emit("gallery_folded", payload)?;
            session.gallery_view = Some(entries);
        }
        "capture_photo" => {
            let path = intent
                .command_args
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default();
            capture_photo(path, session, client, events)?;
        }
        "say" => {
            let text = intent.text.clone().unwrap_or_default();
            chat_turn(&text, session, client, events)?;
        }
        "unknown" => {
            let command = intent
                .command_args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            println!("Unknown command /{command} (try /help)");
        }
        other => {
            bail!("unhandled action '{other}'");
        }
    }
    Ok(())
}

fn capture_photo(
    path: &str,
    session: &mut Session,
    client: &CompletionClient,
    events: &EventLog,
) -> Result<()> {
    if session.screen != Screen::Bot {
        println!("Switch to the bot screen first (/bot).");
        return Ok(());
    }
    if session.phase == BotPhase::Chatting {
        println!("A photo was already captured this session (/reset to start over).");
        return Ok(());
    }
    if path.is_empty() {
        bail!("usage: /photo <path>");
    }

    let path = Path::new(path);
    let image = image::open(path)
        .with_context(|| format!("failed opening photo ({})", path.display()))?;
    let encoded = encode_jpeg(&image)?;

    let mut payload = EventPayload::new();
    payload.insert(
        "fingerprint".to_string(),
        Value::String(fingerprint(&encoded)),
    );
    payload.insert("width".to_string(), Value::Number(image.width().into()));
    payload.insert("height".to_string(), Value::Number(image.height().into()));
    events.emit("photo_captured", payload)?;

    session.transcript.push(ChatTurn::user_photo(encoded));
    session.transcript.push(ChatTurn::user_text(IDENTIFY_PROMPT));
    session.phase = BotPhase::Chatting;

    let reply = client.exchange(&mut session.transcript)?;
    session.transcript.annotate_first_photo(&reply);
    emit_exchange(events, client, &session.transcript, &reply)?;
    Ok(())
}

fn chat_turn(
    text: &str,
    session: &mut Session,
    client: &CompletionClient,
    events: &EventLog,
) -> Result<()> {
    if session.screen != Screen::Bot {
        println!("Switch to the bot screen to chat (/bot).");
        return Ok(());
    }
    if session.phase == BotPhase::AwaitingPhoto {
        println!("Take a photo first (/photo <path>).");
        return Ok(());
    }

    session.transcript.push(ChatTurn::user_text(text));
    let reply = client.exchange(&mut session.transcript)?;
    emit_exchange(events, client, &session.transcript, &reply)?;
    Ok(())
}

fn render(session: &Session) -> Result<()> {
    match session.screen {
        Screen::Bot => render_bot(session),
        Screen::Gallery => render_gallery(session),
    }
}

fn render_bot(session: &Session) -> Result<()> {
    if session.phase == BotPhase::AwaitingPhoto {
        println!("[bot] waiting for a photo (/photo <path>)");
        return Ok(());
    }
    for turn in session.transcript.turns() {
        println!("{}", turn_line(turn)?);
    }
    Ok(())
}

fn render_gallery(session: &Session) -> Result<()> {
    let entries = session.gallery_view.as_deref().unwrap_or_default();
    if entries.is_empty() {
        println!("[gallery] empty");
        return Ok(());
    }
    for (index, entry) in entries.iter().enumerate() {
        println!(
            "[gallery] {} {}\n    {}",
            index + 1,
            summarize_photo(&entry.image)?,
            entry.description
        );
    }
    Ok(())
}

fn turn_line(turn: &ChatTurn) -> Result<String> {
    Ok(match &turn.content {
        TurnContent::Photo(image_b64) => {
            format!("[{}] {}", turn.role.as_str(), summarize_photo(image_b64)?)
        }
        TurnContent::Text(text) => format!("[{}] {}", turn.role.as_str(), text),
    })
}

/// Terminal stand-in for an inline thumbnail: decoded dimensions plus a
/// short fingerprint.
fn summarize_photo(image_b64: &str) -> Result<String> {
    let image = decode_jpeg(image_b64)?;
    let digest = fingerprint(image_b64);
    Ok(format!(
        "<photo {}x{} {}>",
        image.width(),
        image.height(),
        &digest[..8]
    ))
}

fn require_api_key() -> Result<String> {
    match env::var("OPENAI_API_KEY") {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => bail!("OPENAI_API_KEY is not set; refusing to start"),
    }
}

fn emit_session_started(
    events: &EventLog,
    session: &Session,
    client: &CompletionClient,
    store: &GalleryStore,
) -> Result<()> {
    let mut payload = EventPayload::new();
    payload.insert(
        "model".to_string(),
        Value::String(client.model().to_string()),
    );
    payload.insert(
        "gallery".to_string(),
        Value::String(store.path().display().to_string()),
    );
    payload.insert(
        "started_at".to_string(),
        Value::String(session.transcript.started_at.clone()),
    );
    events.emit("session_started", payload)?;
    Ok(())
}

fn emit_screen_changed(events: &EventLog, screen: Screen) -> Result<()> {
    let mut payload = EventPayload::new();
    payload.insert(
        "screen".to_string(),
        Value::String(screen.as_str().to_string()),
    );
    events.emit("screen_changed", payload)?;
    Ok(())
}

fn emit_exchange(
    events: &EventLog,
    client: &CompletionClient,
    transcript: &Transcript,
    reply: &str,
) -> Result<()> {
    let mut payload = EventPayload::new();
    payload.insert(
        "model".to_string(),
        Value::String(client.model().to_string()),
    );
    payload.insert("turns".to_string(), Value::Number(transcript.len().into()));
    payload.insert(
        "reply_chars".to_string(),
        Value::Number(reply.chars().count().into()),
    );
    if reply.is_empty() {
        payload.insert("empty_reply".to_string(), Value::Bool(true));
    }
    events.emit("completion_exchange", payload)?;
    Ok(())
}
