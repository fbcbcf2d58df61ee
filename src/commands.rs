//! Command-line subcommands.

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Precache the app shell for the configured build version
  Install,

  /// Drop cache generations of older builds and claim open tabs
  Activate,

  /// Request a path of the origin through the caching strategies
  Get {
    /// Path relative to the origin, e.g. /assets/index.js
    path: String,

    /// Issue the request as a full-page navigation
    #[arg(long)]
    navigate: bool,

    /// Simulate having no connection
    #[arg(long)]
    offline: bool,
  },

  /// Save an entry: sent directly when online, queued otherwise
  Submit {
    #[arg(long)]
    title: String,

    #[arg(long, default_value = "")]
    note: String,

    /// Keep a local entry even when the write is sent directly
    #[arg(long)]
    mirror: bool,

    /// Simulate having no connection
    #[arg(long)]
    offline: bool,
  },

  /// Flush the outbox to the backend now
  Sync,

  /// Post a raw tab message to the worker, e.g. '{"type":"SYNC_NOW"}'
  Post { message: String },

  /// List queued writes
  Outbox,

  /// List mirror entries
  Entries,

  /// Delete a mirror entry (and its queued write, if still pending)
  DeleteEntry { id: i64 },

  /// Render a push payload as a notification
  Push {
    /// JSON payload; defaults apply to anything missing or malformed
    payload: Option<String>,

    /// Simulate a click on the notification with this action
    #[arg(long)]
    click: Option<Option<String>>,
  },

  /// Register a push subscription with the backend
  Subscribe {
    /// Subscription JSON (must contain an endpoint)
    subscription: String,
  },

  /// Ask the backend to push a test notification
  PushTest,

  /// Keep a tab open and drive it from stdin (`help` lists its commands)
  Tab,
}

/// A line typed into an interactive tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabCommand {
  Online,
  Offline,
  Sync,
  Entries,
  /// `submit <title> | <note>`
  Submit { title: String, note: String },
  Help,
  Quit,
}

/// Interactive tab commands with their aliases
pub const TAB_COMMANDS: &[(&str, &[&str], &str)] = &[
  ("online", &["on"], "Bring the connection back"),
  ("offline", &["off"], "Drop the connection"),
  ("sync", &["s"], "Ask the worker to flush the outbox"),
  ("entries", &["e", "ls"], "List mirror entries"),
  ("submit", &["add", "a"], "Save an entry: submit <title> | <note>"),
  ("help", &["h", "?"], "Show this list"),
  ("quit", &["q", "exit"], "Close the tab"),
];

impl TabCommand {
  /// Parse one input line. Names and aliases match case-insensitively.
  pub fn parse(line: &str) -> Result<Self, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let word = word.to_lowercase();

    let name = TAB_COMMANDS
      .iter()
      .find(|(name, aliases, _)| *name == word || aliases.contains(&word.as_str()))
      .map(|(name, _, _)| *name)
      .ok_or_else(|| format!("unknown command '{}', try 'help'", word))?;

    let command = match name {
      "online" => TabCommand::Online,
      "offline" => TabCommand::Offline,
      "sync" => TabCommand::Sync,
      "entries" => TabCommand::Entries,
      "help" => TabCommand::Help,
      "quit" => TabCommand::Quit,
      _ => {
        let (title, note) = rest.split_once('|').unwrap_or((rest, ""));
        let title = title.trim();
        if title.is_empty() {
          return Err("usage: submit <title> | <note>".to_string());
        }
        TabCommand::Submit {
          title: title.to_string(),
          note: note.trim().to_string(),
        }
      }
    };

    Ok(command)
  }
}

impl Command {
  /// Whether the command runs with the connection simulated as down.
  pub fn offline(&self) -> bool {
    match self {
      Command::Get { offline, .. } | Command::Submit { offline, .. } => *offline,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  fn parse(args: &[&str]) -> Command {
    Cli::try_parse_from(std::iter::once("outpost").chain(args.iter().copied()))
      .unwrap()
      .command
  }

  #[test]
  fn test_get_flags() {
    assert_eq!(
      parse(&["get", "/about", "--navigate", "--offline"]),
      Command::Get {
        path: "/about".to_string(),
        navigate: true,
        offline: true,
      }
    );
  }

  #[test]
  fn test_submit_note_is_optional() {
    let cmd = parse(&["submit", "--title", "A"]);
    assert_eq!(
      cmd,
      Command::Submit {
        title: "A".to_string(),
        note: String::new(),
        mirror: false,
        offline: false,
      }
    );
    assert!(!cmd.offline());
  }

  #[test]
  fn test_push_click_action() {
    assert_eq!(
      parse(&["push", "--click"]),
      Command::Push {
        payload: None,
        click: Some(None),
      }
    );
    assert_eq!(
      parse(&["push", "{}", "--click", "dismiss"]),
      Command::Push {
        payload: Some("{}".to_string()),
        click: Some(Some("dismiss".to_string())),
      }
    );
  }

  #[test]
  fn test_tab_command_aliases() {
    assert_eq!(TabCommand::parse("off"), Ok(TabCommand::Offline));
    assert_eq!(TabCommand::parse("  ONLINE "), Ok(TabCommand::Online));
    assert_eq!(TabCommand::parse("q"), Ok(TabCommand::Quit));
    assert!(TabCommand::parse("frobnicate").is_err());
  }

  #[test]
  fn test_tab_submit_splits_title_and_note() {
    assert_eq!(
      TabCommand::parse("submit Groceries | milk, eggs"),
      Ok(TabCommand::Submit {
        title: "Groceries".to_string(),
        note: "milk, eggs".to_string(),
      })
    );
    assert_eq!(
      TabCommand::parse("a Call mom"),
      Ok(TabCommand::Submit {
        title: "Call mom".to_string(),
        note: String::new(),
      })
    );
    assert!(TabCommand::parse("submit").is_err());
  }

  #[test]
  fn test_post_takes_raw_json() {
    assert_eq!(
      parse(&["post", r#"{"type":"SYNC_NOW"}"#]),
      Command::Post {
        message: r#"{"type":"SYNC_NOW"}"#.to_string(),
      }
    );
  }

  #[test]
  fn test_kebab_case_names() {
    assert_eq!(parse(&["delete-entry", "4"]), Command::DeleteEntry { id: 4 });
    assert_eq!(parse(&["push-test"]), Command::PushTest);
  }
}
