//! Operator console: reads admin commands from stdin on a side thread and
//! forwards them to the event loop.
//!
//! ```text
//! list                    log connected client ids
//! kick <id> [reason...]   disconnect a client
//! say <text...>           broadcast an announcement
//! quit                    stop the relay
//! ```

use std::io::{self, BufRead};
use std::thread::{self, JoinHandle};

use log::{error, warn};
use thiserror::Error;

use crate::relay::{ClientId, Command, CommandSender};

const DEFAULT_KICK_REASON: &str = "Connection closed by server";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command `{0}` (try list, kick, say, quit)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parses one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb {
        "list" | "ls" => Command::ListClients,
        "kick" => {
            let (id, reason) = match rest.split_once(char::is_whitespace) {
                Some((id, reason)) => (id, reason.trim()),
                None => (rest, ""),
            };
            if id.is_empty() {
                return Err(ConsoleError::Usage("kick <id> [reason]"));
            }
            let reason = if reason.is_empty() { DEFAULT_KICK_REASON } else { reason };
            Command::Disconnect {
                id: ClientId::from(id),
                reason: reason.to_string(),
            }
        }
        "say" => {
            if rest.is_empty() {
                return Err(ConsoleError::Usage("say <text>"));
            }
            Command::Announce(rest.to_string())
        }
        "quit" | "exit" => Command::Shutdown,
        other => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Spawns the stdin reader. The thread ends after `quit`, on EOF (sending a
/// shutdown), or when the event loop stops accepting commands.
pub fn spawn(mut sender: CommandSender) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("relay-console".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("console read failed: {e}");
                        break;
                    }
                };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        let quit = command == Command::Shutdown;
                        if let Err(e) = sender.send(command) {
                            error!("console command dropped: {e}");
                            return;
                        }
                        if quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{e}"),
                }
            }
            if let Err(e) = sender.send(Command::Shutdown) {
                error!("shutdown after console EOF failed: {e}");
            }
        })
}
