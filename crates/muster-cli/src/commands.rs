/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Post(String),
    Join(String),
    Channels,
    Feed,
    /// Toggle `emoji` on the n-th feed entry (1-based).
    React(usize, String),
    Reply(usize),
    Attach(String),
    Edit(usize, String),
    Delete(usize),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                 post to the active channel
  /join <channel>        switch channel
  /channels              list channels
  /feed                  show the feed
  /react <n> <emoji>     toggle a reaction on entry n
  /reply <n>             reply to entry n with the next post
  /attach <path>         attach a file to the next post
  /edit <n> <text>       edit entry n
  /delete <n>            delete entry n
  /quit";

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Post(line.to_string()));
    };

    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match name {
        "join" if !args.is_empty() => Ok(Command::Join(args.to_string())),
        "channels" => Ok(Command::Channels),
        "feed" => Ok(Command::Feed),
        "react" => {
            let (n, emoji) = index_and_text(args)?;
            Ok(Command::React(n, emoji))
        }
        "reply" => Ok(Command::Reply(index(args)?)),
        "attach" if !args.is_empty() => Ok(Command::Attach(args.to_string())),
        "edit" => {
            let (n, text) = index_and_text(args)?;
            Ok(Command::Edit(n, text))
        }
        "delete" => Ok(Command::Delete(index(args)?)),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        _ => Err(format!("unknown command '/{name}', try /help")),
    }
}

fn index(arg: &str) -> Result<usize, String> {
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected an entry number, got '{arg}'")),
    }
}

fn index_and_text(args: &str) -> Result<(usize, String), String> {
    let (n, text) = args.split_once(' ').unwrap_or((args, ""));
    let text = text.trim();
    if text.is_empty() {
        return Err("missing text after the entry number".into());
    }
    Ok((index(n)?, text.to_string()))
}
