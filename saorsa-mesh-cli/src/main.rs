//! Saorsa Mesh CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use saorsa_mesh_core::prelude::*;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant id for the first demo participant (e.g., "alice-bob-charlie-david")
    #[arg(short, long, env = "SAORSA_MESH_IDENTITY")]
    identity: Option<String>,

    /// JSON mesh configuration file
    #[arg(short, long, global = true, env = "SAORSA_MESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback mesh call between in-process participants
    Demo {
        /// Number of participants
        #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(2..=8))]
        participants: u16,

        /// Capture video
        #[arg(long)]
        video: bool,

        /// Capture audio
        #[arg(long)]
        audio: bool,

        /// Seconds to keep the call up
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },

    /// Decode and pretty-print a signaling envelope
    Decode {
        /// Envelope JSON
        json: String,
    },

    /// Show configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("saorsa_mesh=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            participants,
            video,
            audio,
            duration,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            println!("🔗 Using identity: {}", identity);
            demo::run(demo::DemoOptions {
                identity,
                participants: usize::from(participants),
                video,
                audio,
                duration: std::time::Duration::from_secs(duration),
                config,
            })
            .await?;
        }
        Commands::Decode { json } => {
            println!("{}", describe_envelope(&json)?);
        }
        Commands::Status => {
            handle_status(&config)?;
        }
    }

    Ok(())
}

/// Load a [`MeshConfig`] from `path`, or the defaults
fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    let Some(path) = path else {
        return Ok(MeshConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

fn describe_envelope(json: &str) -> Result<String> {
    let envelope = Envelope::from_json(json)?;
    let target = match &envelope.to {
        Some(to) => to.to_string(),
        None => "<broadcast>".to_string(),
    };
    let mut out = format!(
        "📨 {} in call {}: {} -> {}\n",
        envelope.kind, envelope.call_id, envelope.from, target
    );
    if let Some(desc) = envelope.description() {
        out.push_str(&format!(
            "   {:?} description, {} SDP lines\n",
            desc.sdp_type,
            desc.sdp.lines().count()
        ));
    }
    if let Some(candidate) = envelope.ice_candidate() {
        out.push_str(&format!("   candidate: {}\n", candidate.candidate));
    }
    out.push_str(&serde_json::to_string_pretty(&envelope)?);
    Ok(out)
}

fn handle_status(config: &MeshConfig) -> Result<()> {
    println!("📊 Saorsa Mesh CLI Status");
    println!("========================");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Glare policy: {:?}", config.glare_policy);
    println!("Event capacity: {}", config.event_capacity);
    println!("ICE servers:");
    for server in &config.ice_servers {
        println!("  {}", server.urls.join(", "));
    }
    println!();
    println!("Available commands:");
    println!("  saorsa-mesh demo [options]   - Run a loopback mesh call");
    println!("  saorsa-mesh decode <json>    - Inspect a signaling envelope");
    println!("  saorsa-mesh status           - Show this status");
    println!();
    println!("Use 'saorsa-mesh --help' for detailed options");

    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu", "atlas", "beacon",
        "comet", "dragon", "eagle", "falcon", "galaxy", "harbor", "icarus", "jupiter", "knight",
        "lunar", "meteor", "nebula", "orbit", "phoenix", "quasar", "rocket", "stellar", "titan",
        "universe", "vortex",
    ];

    let mut rng = rand::thread_rng();
    let indices: Vec<usize> = (0..4).map(|_| rng.gen_range(0..WORDS.len())).collect();

    format!(
        "{}-{}-{}-{}",
        WORDS[indices[0]], WORDS[indices[1]], WORDS[indices[2]], WORDS[indices[3]]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_demo() {
        let cli = Cli::try_parse_from([
            "saorsa-mesh",
            "demo",
            "--participants",
            "4",
            "--audio",
        ])
        .unwrap();
        match cli.command {
            Commands::Demo {
                participants,
                video,
                audio,
                ..
            } => {
                assert_eq!(participants, 4);
                assert!(audio);
                assert!(!video);
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_cli_rejects_single_participant() {
        assert!(Cli::try_parse_from(["saorsa-mesh", "demo", "--participants", "1"]).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ice_servers":[{{"urls":["stun:stun.example.org:3478"]}}],"glare_policy":"lower_id_wins"}}"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.glare_policy, GlarePolicy::LowerIdWins);
        assert_eq!(config.ice_servers, vec![IceServer::stun("stun:stun.example.org:3478")]);
        assert_eq!(config.event_capacity, MeshConfig::default().event_capacity);
    }

    #[test]
    fn test_load_config_reports_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_config(Some(file.path())).is_err());
        assert_eq!(load_config(None).unwrap(), MeshConfig::default());
    }

    #[test]
    fn test_describe_envelope() {
        let json = r#"{"kind":"joined","call_id":"room","from":"alice"}"#;
        let out = describe_envelope(json).unwrap();
        assert!(out.starts_with("📨 JOINED in call room: alice -> <broadcast>"));
        assert!(describe_envelope("{}").is_err());
    }

    #[test]
    fn test_random_identity_has_four_words() {
        let id = generate_random_identity();
        assert_eq!(id.split('-').count(), 4);
    }
}
