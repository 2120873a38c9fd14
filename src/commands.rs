/// Console commands of the watch loop and their lookup

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
  Check,
  Visible,
  Hidden,
  Clear,
  SkipWaiting,
  Push,
  Click,
  Flush,
  Status,
  Quit,
}

#[derive(Debug, Clone)]
pub struct Command {
  pub kind: CommandKind,
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All console commands
pub const COMMANDS: &[Command] = &[
  Command {
    kind: CommandKind::Check,
    name: "check",
    aliases: &["c", "update"],
    description: "Compare local and server versions now",
  },
  Command {
    kind: CommandKind::Visible,
    name: "visible",
    aliases: &["v", "show", "focus"],
    description: "Bring the client to the foreground",
  },
  Command {
    kind: CommandKind::Hidden,
    name: "hidden",
    aliases: &["h", "hide", "blur"],
    description: "Send the client to the background",
  },
  Command {
    kind: CommandKind::Clear,
    name: "clear",
    aliases: &["cc", "clear-cache"],
    description: "Post CLEAR_CACHE to the worker",
  },
  Command {
    kind: CommandKind::SkipWaiting,
    name: "skip",
    aliases: &["sw", "skip-waiting"],
    description: "Post SKIP_WAITING to the waiting worker",
  },
  Command {
    kind: CommandKind::Push,
    name: "push",
    aliases: &["p", "notify"],
    description: "Deliver a push payload (rest of the line)",
  },
  Command {
    kind: CommandKind::Click,
    name: "click",
    aliases: &["k", "open"],
    description: "Click a notification with the given data JSON",
  },
  Command {
    kind: CommandKind::Flush,
    name: "flush",
    aliases: &["f", "replay"],
    description: "Replay queued offline writes",
  },
  Command {
    kind: CommandKind::Status,
    name: "status",
    aliases: &["st", "info"],
    description: "Show version, generations and queue",
  },
  Command {
    kind: CommandKind::Quit,
    name: "quit",
    aliases: &["q", "exit"],
    description: "Stop watching",
  },
];

/// Get suggestions for a given input, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    if cmd.name == input_lower {
      matches.push((cmd, 0));
      continue;
    }

    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Split a console line into the best matching command and its argument.
pub fn parse_line(line: &str) -> Option<(&'static Command, &str)> {
  let line = line.trim();
  let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
  if word.is_empty() {
    return None;
  }
  get_suggestions(word)
    .into_iter()
    .next()
    .map(|cmd| (cmd, rest.trim()))
}
