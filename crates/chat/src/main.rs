use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use vela::{
    ChatError, ChatSession, Direction, NoticeLevel, SendOutcome, SessionUpdate, SettingsError,
    SettingsStore,
};
use vela_storage::{ChatRecord, MemoryStorage, SqliteStorage, Storage, StorageError};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open conversation store on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to start chat session on `{stage}`: {source}"))]
    StartSession {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to write settings on `{stage}`: {source}"))]
    WriteSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

const STARTER_PROMPTS: [&str; 4] = [
    "What are the latest trends in AI?",
    "How does machine learning work?",
    "Explain quantum computing",
    "Best practices for React development",
];

#[derive(Debug, Default)]
struct CliOptions {
    in_memory: bool,
    write_config: bool,
    config_path: Option<PathBuf>,
}

impl CliOptions {
    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--memory" => options.in_memory = true,
                "--write-config" => options.write_config = true,
                "--config" => options.config_path = args.next().map(PathBuf::from),
                other => tracing::warn!(argument = other, "ignoring unknown argument"),
            }
        }
        options
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    New,
    List,
    Open(usize),
    Delete(usize),
    Title(String),
    Stop,
    Regenerate,
    Branch(Direction),
    Suggest(Option<usize>),
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };
        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, argument)| (name, argument.trim()))
            .unwrap_or((command, ""));

        match name {
            "new" => Self::New,
            "list" => Self::List,
            "open" => argument
                .parse()
                .map(Self::Open)
                .unwrap_or_else(|_| Self::Unknown(line.to_string())),
            "delete" => argument
                .parse()
                .map(Self::Delete)
                .unwrap_or_else(|_| Self::Unknown(line.to_string())),
            "title" => Self::Title(argument.to_string()),
            "suggest" if argument.is_empty() => Self::Suggest(None),
            "suggest" => argument
                .parse()
                .map(|number| Self::Suggest(Some(number)))
                .unwrap_or_else(|_| Self::Unknown(line.to_string())),
            "stop" => Self::Stop,
            "regen" => Self::Regenerate,
            "prev" => Self::Branch(Direction::Prev),
            "next" => Self::Branch(Direction::Next),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Prints revealed text incrementally for the conversation on screen.
#[derive(Default)]
struct Printer {
    printed_chars: usize,
}

impl Printer {
    fn render(&mut self, session: &ChatSession, update: &SessionUpdate) {
        if session.active_conversation_id() != Some(update.conversation_id()) {
            return;
        }

        match update {
            SessionUpdate::Streaming { .. } => {
                self.printed_chars = 0;
                print!("assistant: ");
            }
            SessionUpdate::Content { content, .. } => self.print_suffix(content),
            SessionUpdate::Completed {
                content,
                message_key,
                ..
            } => {
                self.print_suffix(content);
                match session.branch_indicator(*message_key) {
                    Some((current, total)) if total > 1 => println!("  [{current} / {total}]"),
                    _ => println!(),
                }
            }
            SessionUpdate::Stopped { .. } => println!("  [stopped]"),
            SessionUpdate::Failed { message, .. } => println!("\nerror: {message}"),
        }
        let _ = std::io::stdout().flush();
    }

    fn print_suffix(&mut self, content: &str) {
        let suffix = content.chars().skip(self.printed_chars).collect::<String>();
        self.printed_chars += suffix.chars().count();
        print!("{suffix}");
    }
}

fn print_help() {
    println!("Type a message to chat. Commands:");
    println!("  /new  /list  /open <n>  /delete <n>  /title <text>");
    println!("  /stop  /regen  /prev  /next  /suggest [n]  /help  /quit");
}

fn print_suggestions() {
    for (index, prompt) in STARTER_PROMPTS.iter().enumerate() {
        println!("  {}. {prompt}", index + 1);
    }
}

fn starter_prompt(number: usize) -> Option<&'static str> {
    STARTER_PROMPTS.get(number.checked_sub(1)?).copied()
}

fn print_conversation(session: &ChatSession) {
    let Some(conversation) = session.conversation() else {
        println!("(no conversation)");
        return;
    };
    println!("== {} ==", conversation.title);
    for message in &conversation.messages {
        let (current, total) = message.branch_indicator();
        let role = match message.role {
            vela::Role::User => "you",
            vela::Role::Assistant => "assistant",
        };
        if total > 1 {
            println!("{role}: {}  [{current} / {total}]", message.content());
        } else {
            println!("{role}: {}", message.content());
        }
    }
}

fn flush_notices(session: &mut ChatSession) {
    for notice in session.drain_notices() {
        match notice.level {
            NoticeLevel::Info => println!("* {}", notice.message),
            NoticeLevel::Error => println!("! {}", notice.message),
        }
    }
}

fn execute(
    session: &mut ChatSession,
    printer: &mut Printer,
    listed: &mut Vec<ChatRecord>,
    command: Command,
) -> Result<(), ChatError> {
    match command {
        Command::Send(text) => match session.send(&text)? {
            SendOutcome::Submitted { .. } | SendOutcome::Ignored => {}
            SendOutcome::Busy => println!("still answering, use /stop first"),
        },
        Command::New => {
            session.new_conversation()?;
        }
        Command::List => {
            *listed = session.list_conversations()?;
            if listed.is_empty() {
                println!("(no conversations)");
            }
            for (index, chat) in listed.iter().enumerate() {
                let marker = if session.active_conversation_id() == Some(chat.id) {
                    '*'
                } else {
                    ' '
                };
                println!("{marker}{:>3}. {}", index + 1, chat.title);
            }
        }
        Command::Open(number) => match listed.get(number.wrapping_sub(1)) {
            Some(chat) => {
                session.select_conversation(chat.id)?;
                print_conversation(session);
            }
            None => println!("no conversation #{number}, try /list"),
        },
        Command::Delete(number) => match listed.get(number.wrapping_sub(1)).map(|chat| chat.id) {
            Some(chat_id) => {
                session.delete_conversation(chat_id)?;
                listed.retain(|chat| chat.id != chat_id);
            }
            None => println!("no conversation #{number}, try /list"),
        },
        Command::Title(title) => session.rename_conversation(&title)?,
        Command::Stop => {
            if let Some(update) = session.stop() {
                printer.render(session, &update);
            }
        }
        Command::Regenerate => {
            let regenerated = session
                .last_assistant_key()
                .is_some_and(|key| session.regenerate(key));
            if !regenerated {
                println!("nothing to regenerate");
            }
        }
        Command::Branch(direction) => {
            let Some(key) = session.last_assistant_key() else {
                println!("no assistant message yet");
                return Ok(());
            };
            session.select_branch(key, direction);
            print_conversation(session);
        }
        Command::Suggest(None) => print_suggestions(),
        Command::Suggest(Some(number)) => match starter_prompt(number) {
            Some(prompt) => {
                println!("you: {prompt}");
                return execute(session, printer, listed, Command::Send(prompt.to_string()));
            }
            None => println!("no suggestion #{number}, try /suggest"),
        },
        Command::Help => print_help(),
        Command::Quit => {}
        Command::Unknown(line) => println!("unknown command: {line}"),
    }
    Ok(())
}

async fn run_terminal(session: &mut ChatSession) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::default();
    let mut listed = Vec::new();
    print_help();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                    break;
                };
                let command = Command::parse(&line);
                if command == Command::Quit {
                    break;
                }
                if let Err(error) = execute(session, &mut printer, &mut listed, command) {
                    tracing::warn!(stage = error.stage(), %error, "command failed");
                    println!("! {error}");
                }
                flush_notices(session);
            }
            Some(update) = session.next_update(), if session.is_busy() => {
                printer.render(session, &update);
                flush_notices(session);
            }
        }
    }

    if let Some(update) = session.stop() {
        printer.render(session, &update);
    }
    flush_notices(session);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = CliOptions::parse(std::env::args().skip(1));
    let settings_store = match options.config_path.clone() {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();

    if options.write_config {
        settings_store
            .update((*settings).clone())
            .context(WriteSettingsSnafu {
                stage: "write-config",
            })?;
        println!("wrote {}", settings_store.config_path().display());
        return Ok(());
    }

    let storage: Arc<dyn Storage> = if options.in_memory {
        Arc::new(MemoryStorage::new())
    } else {
        let location = settings.database_location();
        tracing::info!(database = %location, "opening conversation store");
        Arc::new(
            SqliteStorage::open(&location)
                .await
                .context(OpenStorageSnafu {
                    stage: "open-sqlite-store",
                })?,
        )
    };
    if settings.caller().is_none() {
        tracing::warn!("no user_id configured, conversations will not be saved");
    }

    let mut session = ChatSession::from_settings(storage, &settings).context(StartSessionSnafu {
        stage: "session-from-settings",
    })?;
    run_terminal(&mut session).await
}
