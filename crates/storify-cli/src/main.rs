use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use storify_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use storify_contracts::session::SessionManifest;
use storify_engine::{export_narrative, PromptMode, StorySession, DEFAULT_STORY_MODEL};

#[derive(Debug, Parser)]
#[command(name = "storify", version, about = "Generate stories from images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_STORY_MODEL)]
    model: String,
    #[arg(long)]
    speech_model: Option<String>,
    #[arg(long, default_value = "en")]
    voice: String,
    /// Wait for the complete narrative instead of rendering fragments as
    /// they arrive.
    #[arg(long)]
    no_stream: bool,
    #[arg(long)]
    image: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_STORY_MODEL)]
    model: String,
    #[arg(long)]
    speech_model: Option<String>,
    #[arg(long, default_value = "en")]
    voice: String,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    /// Session directory (or a session.json path) from an earlier chat.
    #[arg(long)]
    session: PathBuf,
    /// 1-based story number; defaults to the most recent story.
    #[arg(long)]
    story: Option<usize>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    speech_model: Option<String>,
    #[arg(long, default_value = "en")]
    voice: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storify error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_one_shot(args),
        Command::Export(args) => run_export(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut session = StorySession::new(&args.out, &events_path, Some(args.model.clone()))?;
    if let Some(model) = args.speech_model.clone() {
        session.set_speech_model(Some(model));
    }
    session.set_voice(args.voice.clone());
    if let Some(path) = args.image.as_deref() {
        attach_image_from_path(&mut session, path)?;
    }

    let stdin = io::stdin();
    let mut line = String::new();
    let mut selected_story: Option<usize> = None;
    let streamed = !args.no_stream;

    println!("Storify chat started. Type /help for commands.");

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
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "set_model" => {
                if let Some(model) = value_as_non_empty_string(intent.command_args.get("model")) {
                    session.set_story_model(Some(model.clone()));
                    println!("Story model set to {model}");
                } else {
                    println!("/model requires a model name");
                }
            }
            "set_voice" => {
                if let Some(voice) = value_as_non_empty_string(intent.command_args.get("voice")) {
                    session.set_voice(voice.clone());
                    println!("Voice set to {voice}");
                } else {
                    println!("/voice requires a language code (e.g. en)");
                }
            }
            "attach_image" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/image requires a path");
                    continue;
                };
                match attach_image_from_path(&mut session, Path::new(&path)) {
                    Ok(()) => {}
                    Err(err) => println!("Image error: {err:#}"),
                }
            }
            "list_stories" => {
                let stories = session.stories();
                if stories.is_empty() {
                    println!("No stories yet. Attach an image and describe the story you want.");
                } else {
                    for (index, story) in stories.iter().enumerate() {
                        let marker = if selected_story == Some(index) { "*" } else { " " };
                        println!(
                            "{marker} Story {} ({} chars)",
                            index + 1,
                            story.chars().count()
                        );
                    }
                    println!("Select one with /select <n>, then /download.");
                }
            }
            "select_story" => {
                let arg = value_as_non_empty_string(intent.command_args.get("story"));
                let total = session.stories().len();
                let Some(number) = arg.and_then(|value| value.parse::<usize>().ok()) else {
                    println!("/select requires a story number");
                    continue;
                };
                if number == 0 || number > total {
                    println!("Story {number} does not exist (have {total})");
                    continue;
                }
                selected_story = Some(number - 1);
                println!("Story {number} selected; /download will export it.");
            }
            "download" => {
                let Some(index) = selected_story else {
                    println!("Select a story first with /select <n>");
                    continue;
                };
                let dir = value_as_non_empty_string(intent.command_args.get("dir"))
                    .unwrap_or_else(|| ".".to_string());
                match session.prepare_download(index, Path::new(&dir)) {
                    Ok(bundle) => {
                        println!("Text ready: {}", bundle.text_path.display());
                        println!("Audio ready: {}", bundle.audio_path.display());
                    }
                    Err(err) => println!("Error preparing download: {err:#}"),
                }
            }
            "tweak" => {
                let prompt = intent.prompt.as_deref().unwrap_or("").trim().to_string();
                if prompt.is_empty() {
                    println!("/tweak requires revision text");
                    continue;
                }
                if session.stories().is_empty() {
                    println!("No story to tweak yet. Generate one first.");
                    continue;
                }
                run_generation(&mut session, &prompt, PromptMode::Tweak, streamed);
            }
            "generate" => {
                let prompt = intent.prompt.as_deref().unwrap_or("").trim().to_string();
                if prompt.is_empty() {
                    continue;
                }
                if session.image().is_none() {
                    println!("Please attach an image first with /image <path>.");
                    continue;
                }
                run_generation(&mut session, &prompt, PromptMode::Generate, streamed);
            }
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            _ => {}
        }
    }

    session.finish()?;
    Ok(())
}

fn run_generation(session: &mut StorySession, guidelines: &str, mode: PromptMode, streamed: bool) {
    if !streamed {
        match session.generate(guidelines, mode) {
            Ok(narrative) => {
                println!("{narrative}");
                println!("Story {} ready.", session.stories().len());
            }
            Err(err) => println!("Error generating story: {err:#}"),
        }
        return;
    }

    let stream = match session.open_stream(guidelines, mode) {
        Ok(stream) => stream,
        Err(err) => {
            println!("Error generating story: {err:#}");
            return;
        }
    };

    let mut narrative = String::new();
    for fragment in stream {
        match fragment {
            Ok(fragment) => {
                print!("{fragment}");
                let _ = io::stdout().flush();
                narrative.push_str(&fragment);
            }
            Err(err) => {
                println!();
                // No partial turn is committed; the dangling user turn stays
                // visible so the user can resubmit.
                if let Err(record_err) = session.record_generation_failure(&format!("{err:#}")) {
                    eprintln!("storify error: {record_err:#}");
                }
                println!("Error generating story: {err:#}");
                return;
            }
        }
    }
    println!();

    if narrative.is_empty() {
        if let Err(record_err) = session.record_generation_failure("model returned no narrative") {
            eprintln!("storify error: {record_err:#}");
        }
        println!("Error generating story: model returned no narrative");
        return;
    }

    match session.commit_narrative(&narrative) {
        Ok(index) => println!("Story {} ready.", index + 1),
        Err(err) => println!("Error generating story: {err:#}"),
    }
}

fn attach_image_from_path(session: &mut StorySession, path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    session.attach_image(&bytes, &path.to_string_lossy())?;
    let Some(payload) = session.image() else {
        bail!("image payload missing after attach");
    };
    println!(
        "Attached {} ({}x{}, {} bytes as jpeg)",
        payload.source, payload.width, payload.height, payload.encoded_len
    );
    Ok(())
}

fn run_one_shot(args: RunArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut session = StorySession::new(&args.out, &events_path, Some(args.model))?;
    if let Some(model) = args.speech_model {
        session.set_speech_model(Some(model));
    }
    session.set_voice(args.voice);

    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    session.attach_image(&bytes, &args.image.to_string_lossy())?;

    let narrative = session.generate(&args.prompt, PromptMode::Generate)?;
    println!("{narrative}");

    let bundle = session.prepare_download(0, &args.out)?;
    println!("Text ready: {}", bundle.text_path.display());
    println!("Audio ready: {}", bundle.audio_path.display());

    session.finish()?;
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let manifest_path = if args.session.is_dir() {
        args.session.join("session.json")
    } else {
        args.session.clone()
    };
    if !manifest_path.exists() {
        bail!("no session manifest at {}", manifest_path.display());
    }

    let manifest = SessionManifest::load(&manifest_path);
    if manifest.stories.is_empty() {
        bail!("session has no stories to export");
    }
    let index = match args.story {
        Some(number) if number >= 1 && number <= manifest.stories.len() => number - 1,
        Some(number) => bail!(
            "story {} out of range (have {})",
            number,
            manifest.stories.len()
        ),
        None => manifest.stories.len() - 1,
    };
    let Some(record) = manifest.get_story(index) else {
        bail!("story {} missing from manifest", index + 1);
    };

    let bundle = export_narrative(
        &record.narrative,
        &args.voice,
        args.speech_model.as_deref(),
        &args.out,
    )?;
    println!("Text ready: {}", bundle.text_path.display());
    println!("Audio ready: {}", bundle.audio_path.display());
    Ok(0)
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
