use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, DOWNLOAD_COMMAND, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SELECT_COMMAND,
    SINGLE_PATH_COMMANDS, TWEAK_COMMAND,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let key = if action == "set_voice" { "voice" } else { "model" };
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert(key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if command == TWEAK_COMMAND.command {
                let mut intent = Intent::new(TWEAK_COMMAND.action, text);
                intent.prompt = Some(arg.to_string());
                return intent;
            }

            if command == SELECT_COMMAND.command {
                let mut intent = Intent::new(SELECT_COMMAND.action, text);
                intent
                    .command_args
                    .insert("story".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if command == DOWNLOAD_COMMAND.command {
                let mut intent = Intent::new(DOWNLOAD_COMMAND.action, text);
                intent.command_args.insert(
                    "dir".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_becomes_generate() {
        let intent = parse_intent("  a dragon story with a twist  ");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.prompt.as_deref(), Some("a dragon story with a twist"));
    }

    #[test]
    fn empty_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_image_quoted_path() {
        let intent = parse_intent("/image \"/tmp/sunset beach.png\"");
        assert_eq!(intent.action, "attach_image");
        assert_eq!(intent.command_args["path"], json!("/tmp/sunset beach.png"));
    }

    #[test]
    fn parse_tweak_keeps_revision_text_verbatim() {
        let intent = parse_intent("/tweak give the dragon a name");
        assert_eq!(intent.action, "tweak");
        assert_eq!(intent.prompt.as_deref(), Some("give the dragon a name"));
    }

    #[test]
    fn parse_select_and_download() {
        let select = parse_intent("/select 2");
        assert_eq!(select.action, "select_story");
        assert_eq!(select.command_args["story"], json!("2"));

        let download = parse_intent("/download out");
        assert_eq!(download.action, "download");
        assert_eq!(download.command_args["dir"], json!("out"));

        let bare = parse_intent("/download");
        assert_eq!(bare.command_args["dir"], json!(""));
    }

    #[test]
    fn parse_model_and_voice_commands() {
        let model = parse_intent("/model gemini-1.5-pro");
        assert_eq!(model.action, "set_model");
        assert_eq!(model.command_args["model"], json!("gemini-1.5-pro"));

        let voice = parse_intent("/voice en");
        assert_eq!(voice.action, "set_voice");
        assert_eq!(voice.command_args["voice"], json!("en"));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/stories").action, "list_stories");
        assert_eq!(parse_intent("/help").action, "help");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
