// Slash command parsing

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Help,
    New,
    Stop,
    Regenerate,
    Edit(String),
    /// Switch to the previous sibling branch of the message at a 1-based
    /// position in the history, or of the deepest fork when omitted
    Previous(Option<usize>),
    Next(Option<usize>),
    History,
    Models,
    Model(String),
    List,
    Open(String),
}

pub enum CommandResult {
    Continue,
    Exit,
}

impl Command {
    pub fn parse(input: &str) -> Result<Self, String> {
        let Some(body) = input.strip_prefix('/') else {
            return Err("Not a command".to_string());
        };

        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        if name.is_empty() {
            return Err("Empty command".to_string());
        }

        match name {
            "quit" | "exit" => Ok(Command::Quit),
            "help" => Ok(Command::Help),
            "new" => Ok(Command::New),
            "stop" => Ok(Command::Stop),
            "regen" | "regenerate" => Ok(Command::Regenerate),
            "edit" => {
                if rest.is_empty() {
                    return Err("Usage: /edit <new text>".to_string());
                }
                Ok(Command::Edit(rest.to_string()))
            }
            "prev" => parse_position(rest).map(Command::Previous),
            "next" => parse_position(rest).map(Command::Next),
            "history" => Ok(Command::History),
            "models" => Ok(Command::Models),
            "model" => {
                if rest.is_empty() {
                    return Err("Usage: /model <name>".to_string());
                }
                Ok(Command::Model(rest.to_string()))
            }
            "list" => Ok(Command::List),
            "open" => {
                if rest.is_empty() {
                    return Err("Usage: /open <conversation id or prefix>".to_string());
                }
                Ok(Command::Open(rest.to_string()))
            }
            _ => Err(format!(
                "Unknown command: /{}. Type /help for available commands.",
                name
            )),
        }
    }
}

fn parse_position(arg: &str) -> Result<Option<usize>, String> {
    if arg.is_empty() {
        return Ok(None);
    }
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(format!("Invalid message position: {}", arg)),
    }
}

pub fn print_help() {
    println!("Available commands:");
    println!("  /quit, /exit           - Exit the chat");
    println!("  /new                   - Start a new conversation");
    println!("  /stop                  - Stop the response being generated");
    println!("  /regen                 - Generate another answer to the last question");
    println!("  /edit <text>           - Re-ask the last question with new text");
    println!("  /prev [n], /next [n]   - Switch branch at message n (default: deepest fork)");
    println!("  /history               - Show the current branch");
    println!("  /models                - List models offered by the server");
    println!("  /model <name>          - Switch model");
    println!("  /list                  - List saved conversations");
    println!("  /open <id>             - Open a saved conversation");
    println!("  /help                  - Show this help message");
    println!("  Ctrl+D                 - Exit the chat");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("/quit"), Ok(Command::Quit));
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
        assert_eq!(Command::parse("/regen"), Ok(Command::Regenerate));
        assert_eq!(Command::parse("/history"), Ok(Command::History));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(
            Command::parse("/edit  what about   Rust?"),
            Ok(Command::Edit("what about   Rust?".to_string()))
        );
        assert_eq!(Command::parse("/model qwen"), Ok(Command::Model("qwen".to_string())));
        assert_eq!(Command::parse("/prev"), Ok(Command::Previous(None)));
        assert_eq!(Command::parse("/next 3"), Ok(Command::Next(Some(3))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("hello").is_err());
        assert!(Command::parse("/").is_err());
        assert!(Command::parse("/edit").is_err());
        assert!(Command::parse("/prev 0").is_err());
        assert!(Command::parse("/prev two").is_err());
        assert!(Command::parse("/bogus").unwrap_err().contains("/bogus"));
    }
}
