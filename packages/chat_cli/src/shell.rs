//! Line-oriented terminal shell over a [`SessionEngine`].
//!
//! Renders engine snapshots to stdout and turns typed lines into intents. The
//! shell keeps no chat state of its own beyond the last snapshot it printed.

use std::sync::Arc;

use anyhow::{Context, Result};
use chat_session::{
    Attachment, ChatError, ConnectionState, DisplayMessage, Origin, SessionEngine, SessionUpdate,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::Settings;

const HELP: &str = "\
commands:
  <text>             send a message
  /delete <text>     delete one of your messages with exactly this text
  /users             list online users
  /history           reprint all messages
  /quit              disconnect and exit
  //text             send a message starting with '/'";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Post(String),
    Delete(String),
    Users,
    History,
    Help,
    Quit,
}

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(Some(Command::Post(format!("/{escaped}"))));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Post(line.to_string())));
    };

    let (name, arg) = match rest.split_once(' ') {
        Some((name, arg)) => (name, arg),
        None => (rest, ""),
    };
    let command = match name {
        "delete" | "del" => {
            if arg.trim().is_empty() {
                return Err("usage: /delete <text>".to_string());
            }
            Command::Delete(arg.to_string())
        }
        "users" | "who" => Command::Users,
        "history" => Command::History,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other} (try /help)")),
    };
    Ok(Some(command))
}

pub fn render_message(message: &DisplayMessage) -> String {
    let time = message.time_label();
    let mut line = match message.origin {
        Origin::System => format!("[{time}] * {}", message.content),
        Origin::SelfSent | Origin::Other => {
            format!("[{time}] {}: {}", message.username, message.content)
        }
    };
    match &message.attachment {
        Some(Attachment::Image { data }) => {
            line.push_str(&format!(" [image, {} bytes encoded]", data.len()));
        }
        Some(Attachment::File { filename, data }) => {
            line.push_str(&format!(" [file {filename}, {} bytes encoded]", data.len()));
        }
        None => {}
    }
    line
}

/// Input mistakes read as plain hints; anything else carries its code.
pub fn render_error(error: &ChatError) -> String {
    if error.is_input_error() {
        format!("[chat: {error}]")
    } else {
        format!("[chat: {error} ({})]", error.code())
    }
}

pub fn render_state(state: &ConnectionState) -> String {
    format!("[chat: {state}]")
}

/// How the message list changed between two snapshots.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageDiff<'a> {
    Appended(&'a [DisplayMessage]),
    Removed(&'a DisplayMessage),
    Reset,
}

pub fn diff_messages<'a>(prev: &'a [DisplayMessage], next: &'a [DisplayMessage]) -> MessageDiff<'a> {
    if next.len() >= prev.len() && next[..prev.len()] == *prev {
        return MessageDiff::Appended(&next[prev.len()..]);
    }
    if next.len() + 1 == prev.len() {
        let split = prev
            .iter()
            .zip(next)
            .position(|(a, b)| a != b)
            .unwrap_or(next.len());
        if prev[split + 1..] == next[split..] {
            return MessageDiff::Removed(&prev[split]);
        }
    }
    MessageDiff::Reset
}

/// What the shell has shown so far.
#[derive(Default)]
pub struct View {
    messages: Arc<Vec<DisplayMessage>>,
    users: Arc<Vec<String>>,
}

impl View {
    /// Lines to print for `update`.
    pub fn apply(&mut self, update: &SessionUpdate) -> Vec<String> {
        match update {
            SessionUpdate::ConnectionStateChanged(state) => vec![render_state(state)],
            SessionUpdate::MessagesChanged(messages) => {
                let lines = match diff_messages(&self.messages, messages) {
                    MessageDiff::Appended(added) => added.iter().map(render_message).collect(),
                    MessageDiff::Removed(gone) => {
                        vec![format!("[deleted] {}", render_message(gone))]
                    }
                    MessageDiff::Reset => messages.iter().map(render_message).collect(),
                };
                self.messages = messages.clone();
                lines
            }
            SessionUpdate::UsersChanged(users) => {
                self.users = users.clone();
                vec![render_users(users)]
            }
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.messages.iter().map(render_message).collect()
    }

    pub fn users(&self) -> String {
        render_users(&self.users)
    }
}

fn render_users(users: &[String]) -> String {
    if users.is_empty() {
        "[chat: nobody online]".to_string()
    } else {
        format!("[chat: online: {}]", users.join(", "))
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// Connect, then run the read/render loop until `/quit`, EOF, ctrl-c, or the
/// session ends on its own.
pub async fn run(settings: Settings, username: String) -> Result<()> {
    let engine = SessionEngine::new(settings.session.clone());
    let mut updates = engine.updates();
    let mut view = View::default();

    engine
        .start(&settings.server_url, &username)
        .await
        .with_context(|| format!("could not join {}", settings.server_url))?;
    info!(server = %settings.server_url, username = %username, "joined chat");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                print_lines(&view.apply(&update));
                if update == SessionUpdate::ConnectionStateChanged(ConnectionState::Disconnected) {
                    // Gave up reconnecting; let the trailing notice render
                    while let Ok(update) = updates.try_recv() {
                        print_lines(&view.apply(&update));
                    }
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => execute(&engine, &view, command).await,
                    Ok(None) => {}
                    Err(usage) => println!("[chat: {usage}]"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    match engine.stop().await {
        Ok(()) | Err(ChatError::NotConnected) => {}
        Err(e) => debug!(error = %e, "stop failed"),
    }
    while let Ok(update) = updates.try_recv() {
        print_lines(&view.apply(&update));
    }
    Ok(())
}

async fn execute(engine: &SessionEngine, view: &View, command: Command) {
    let result = match command {
        Command::Post(text) => engine.post_message(&text).await,
        Command::Delete(text) => engine.request_delete(&text).await,
        Command::Users => {
            println!("{}", view.users());
            Ok(())
        }
        Command::History => {
            print_lines(&view.history());
            Ok(())
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        if !e.is_input_error() {
            warn!(code = e.code(), error = %e, "request failed");
        }
        println!("{}", render_error(&e));
    }
}
