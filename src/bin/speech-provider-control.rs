//! speech-provider-control - CLI control utility for the speech provider
//!
//! Talks to a running provider over the session bus.

use clap::{Parser, Subcommand};
use speech_provider::config_loader::Settings;
use speech_provider::service::INTERFACE;
use std::fs::File;
use std::path::PathBuf;
use zbus::blocking::{Connection, MessageIterator};
use zbus::MatchRule;

/// CLI control utility for the speech provider
#[derive(Parser)]
#[command(name = "speech-provider-control")]
#[command(version)]
#[command(about = "Control utility for an org.freedesktop.Speech.Provider service", long_about = None)]
struct Cli {
    /// Bus name of the provider (defaults to the configured one)
    #[arg(long, global = true)]
    dest: Option<String>,

    /// Object path of the provider (defaults to the configured one)
    #[arg(long, global = true)]
    path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak text on the default audio device
    Speak {
        /// Text to speak
        text: String,
        /// Voice id (empty for the provider's default)
        #[arg(short, long, default_value = "")]
        voice: String,
        /// Task id used for pause/resume/cancel
        #[arg(short, long)]
        id: Option<u64>,
        #[arg(long, default_value = "1.0")]
        pitch: f64,
        #[arg(long, default_value = "1.0")]
        rate: f64,
        #[arg(long, default_value = "1.0")]
        volume: f64,
        /// Block until the utterance finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Synthesize text into a file as raw S16LE audio
    Synthesize {
        /// Text to synthesize
        text: String,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "")]
        voice: String,
        #[arg(long, default_value = "1.0")]
        pitch: f64,
        #[arg(long, default_value = "1.0")]
        rate: f64,
    },

    /// Pause a speaking task
    Pause { id: u64 },

    /// Resume a paused task
    Resume { id: u64 },

    /// Cancel a task
    Cancel { id: u64 },

    /// List available voices
    Voices,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let conn = Connection::session()?;

    let settings = Settings::new().unwrap_or_default();
    let dest = cli.dest.unwrap_or_else(|| settings.bus_name());
    let path = cli.path.unwrap_or_else(|| settings.object_path());
    let dest = dest.as_str();
    let path = path.as_str();
    let iface = INTERFACE;

    match cli.command {
        Commands::Speak {
            text,
            voice,
            id,
            pitch,
            rate,
            volume,
            wait,
        } => {
            let id = id.unwrap_or_else(|| std::process::id() as u64);

            // Subscribe before speaking so a short utterance can't finish unseen
            let ends = if wait {
                let rule = MatchRule::builder()
                    .msg_type(zbus::message::Type::Signal)
                    .interface(iface)?
                    .member("SpeechEnd")?
                    .build();
                Some(MessageIterator::for_match_rule(rule, &conn, None)?)
            } else {
                None
            };

            let _: () = conn
                .call_method(
                    Some(dest),
                    path,
                    Some(iface),
                    "Speak",
                    &(id, text.as_str(), voice, pitch, rate, volume),
                )?
                .body()
                .deserialize()?;
            println!("Speaking [{}]: {}", id, text);

            if let Some(ends) = ends {
                for msg in ends {
                    let finished: u64 = msg?.body().deserialize()?;
                    if finished == id {
                        println!("Done [{}]", id);
                        break;
                    }
                }
            }
        }

        Commands::Synthesize {
            text,
            output,
            voice,
            pitch,
            rate,
        } => {
            let file = File::create(&output)?;
            let fd = zbus::zvariant::OwnedFd::from(std::os::fd::OwnedFd::from(file));
            let _: () = conn
                .call_method(
                    Some(dest),
                    path,
                    Some(iface),
                    "Synthesize",
                    &(fd, text, voice, pitch, rate, false),
                )?
                .body()
                .deserialize()?;
            println!("Synthesizing into {}", output.display());
        }

        Commands::Pause { id } => {
            let _: () = conn
                .call_method(Some(dest), path, Some(iface), "Pause", &id)?
                .body()
                .deserialize()?;
            println!("Paused [{}]", id);
        }

        Commands::Resume { id } => {
            let _: () = conn
                .call_method(Some(dest), path, Some(iface), "Resume", &id)?
                .body()
                .deserialize()?;
            println!("Resumed [{}]", id);
        }

        Commands::Cancel { id } => {
            let _: () = conn
                .call_method(Some(dest), path, Some(iface), "Cancel", &id)?
                .body()
                .deserialize()?;
            println!("Cancelled [{}]", id);
        }

        Commands::Voices => {
            let voices: Vec<(String, String, Vec<String>)> = conn
                .call_method(Some(dest), path, Some(iface), "GetVoices", &())?
                .body()
                .deserialize()?;

            if voices.is_empty() {
                println!("No voices installed");
            } else {
                println!("Available Voices");
                println!("────────────────");
                for (name, id, languages) in voices {
                    println!("  {} ({}) [{}]", name, id, languages.join(", "));
                }
            }
        }
    }

    Ok(())
}
