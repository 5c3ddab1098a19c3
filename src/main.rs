use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kamen::config::{SttProvider, TtsProvider};
use kamen::db::{self, SessionStore};
use kamen::voice::{
    AudioCapture, AudioFrame, AudioPlayback, MicrophoneSource, Recognizer, SpeechToText,
    Synthesizer, TextToSpeech,
};
use kamen::{
    AudioNormalizer, Config, ContextBuilder, Error, OllamaClient, TextSanitizer, TurnConfig,
    TurnInput, TurnOrchestrator,
};

/// Kamen - Japanese voice and text conversation assistant
#[derive(Parser)]
#[command(name = "kamen", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/kamen/config.toml)
    #[arg(short, long, env = "KAMEN_CONFIG")]
    config: Option<PathBuf>,

    /// Resume an existing session
    #[arg(short, long)]
    session: Option<String>,

    /// Disable voice input and spoken replies
    #[arg(long, env = "KAMEN_NO_VOICE")]
    no_voice: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive conversation (default)
    Chat,
    /// Run a single text turn
    Say {
        /// What to say
        text: String,
    },
    /// List recent sessions
    Sessions {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a session's recent exchanges
    History {
        /// Session ID
        id: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Delete a session and its exchanges
    Delete {
        /// Session ID
        id: String,
    },
    /// Conversation statistics
    Stats,
    /// List models installed on the Ollama server
    Models {
        /// Pull the configured model if it is missing
        #[arg(long)]
        pull: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,kamen=info",
        1 => "info,kamen=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.no_voice {
        config.voice.enabled = false;
        tracing::info!("voice explicitly disabled via --no-voice");
    }

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let orchestrator = build_orchestrator(&config, cli.session.as_deref()).await?;
            chat(orchestrator).await
        }
        Command::Say { text } => {
            let orchestrator = build_orchestrator(&config, cli.session.as_deref()).await?;
            say(orchestrator, text).await
        }
        Command::Sessions { limit } => list_sessions(&open_store(&config)?, limit),
        Command::History { id, limit } => show_history(&open_store(&config)?, &id, limit),
        Command::Delete { id } => delete_session(&open_store(&config)?, &id),
        Command::Stats => show_stats(&open_store(&config)?),
        Command::Models { pull } => models(&config, pull).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

fn open_store(config: &Config) -> anyhow::Result<SessionStore> {
    let pool = db::init(&config.storage.db_path)?;
    Ok(SessionStore::new(pool))
}

fn ollama_client(config: &Config) -> anyhow::Result<OllamaClient> {
    Ok(OllamaClient::new(
        &config.llm.host,
        config.llm.model.clone(),
        config.llm.timeout,
    )?)
}

fn build_recognizer(config: &Config) -> kamen::Result<Arc<dyn Recognizer>> {
    let voice = &config.voice;
    let stt = match voice.stt_provider {
        SttProvider::Whisper => SpeechToText::new_whisper(
            config.api_keys.openai.clone().unwrap_or_default(),
            voice.stt_model.clone(),
            &voice.stt_base_url,
        )?,
        SttProvider::Deepgram => SpeechToText::new_deepgram(
            config.api_keys.deepgram.clone().unwrap_or_default(),
            voice.stt_model.clone(),
        )?,
    };
    Ok(Arc::new(stt))
}

fn build_synthesizer(config: &Config) -> kamen::Result<Arc<dyn Synthesizer>> {
    let voice = &config.voice;
    let tts = match voice.tts_provider {
        TtsProvider::OpenAI => TextToSpeech::new_openai(
            config.api_keys.openai.clone().unwrap_or_default(),
            voice.tts_voice.clone(),
            voice.tts_speed,
            voice.tts_model.clone(),
            voice.output_dir.clone(),
        )?,
        TtsProvider::ElevenLabs => TextToSpeech::new_elevenlabs(
            config.api_keys.elevenlabs.clone().unwrap_or_default(),
            voice.tts_voice.clone(),
            voice.tts_model.clone(),
            voice.output_dir.clone(),
        )?,
    };
    Ok(Arc::new(tts))
}

/// Wire the store, engines and pipeline components together
async fn build_orchestrator(
    config: &Config,
    session: Option<&str>,
) -> anyhow::Result<TurnOrchestrator> {
    let store = open_store(config)?;
    let ollama = ollama_client(config)?;

    if config.llm.auto_pull {
        match ollama.ensure_model_ready().await {
            Ok(true) => tracing::info!(model = %config.llm.model, "model pulled"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                host = %config.llm.host,
                error = %e,
                "could not check model availability; replies will fall back until the server is reachable"
            ),
        }
    }

    let mut orchestrator = TurnOrchestrator::new(store, Arc::new(ollama), TurnConfig::from_config(config))
        .with_context_builder(ContextBuilder::new(config.context.clone()))
        .with_sanitizer(TextSanitizer::new(config.sanitizer.clone())?)
        .with_normalizer(AudioNormalizer::new(config.voice.sample_rate)?);

    if config.voice.enabled {
        match build_recognizer(config) {
            Ok(recognizer) => {
                orchestrator = orchestrator
                    .with_recognizer(recognizer)
                    .with_audio_source(Arc::new(MicrophoneSource::new()));
            }
            Err(e) => tracing::warn!(error = %e, "voice input unavailable"),
        }
        match build_synthesizer(config) {
            Ok(synthesizer) => orchestrator = orchestrator.with_synthesizer(synthesizer),
            Err(e) => tracing::warn!(error = %e, "spoken replies unavailable"),
        }
    }

    if let Some(id) = session {
        orchestrator.select_session(id)?;
        tracing::info!(session_id = id, "resuming session");
    }

    Ok(orchestrator)
}

/// Run a turn, cancelling it on Ctrl-C
async fn run_cancellable(
    orchestrator: &mut TurnOrchestrator,
    input: TurnInput,
) -> kamen::Result<kamen::TurnOutcome> {
    let cancel = CancellationToken::new();
    let turn = orchestrator.run_turn(input, &cancel);
    tokio::pin!(turn);

    tokio::select! {
        result = &mut turn => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            turn.await
        }
    }
}

fn print_outcome(result: kamen::Result<kamen::TurnOutcome>) {
    match result {
        Ok(outcome) => {
            println!("kamen> {}", outcome.reply);
            if !outcome.persisted {
                println!("  (this exchange was not saved)");
            }
        }
        Err(Error::NoSpeechDetected) => println!("  (no speech detected, try again)"),
        Err(Error::CaptureUnavailable(reason)) => println!("  (microphone unavailable: {reason})"),
        Err(Error::Cancelled) => println!("  (cancelled)"),
        Err(Error::EmptyInput) => {}
        Err(e) => println!("  (error: {e})"),
    }
}

async fn chat(mut orchestrator: TurnOrchestrator) -> anyhow::Result<()> {
    println!("Kamen: type a message and press Enter.");
    if orchestrator.voice_available() {
        println!("Commands: /voice (speak instead of typing), /new [title], /quit");
    } else {
        println!("Commands: /new [title], /quit (voice input unavailable)");
    }
    println!("Ctrl-C cancels a running turn; Ctrl-D exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"you> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/voice" => {
                println!("  (listening...)");
                let result = run_cancellable(&mut orchestrator, TurnInput::Voice).await;
                if let Ok(outcome) = &result {
                    println!("you (voice)> {}", outcome.user_text);
                }
                print_outcome(result);
            }
            _ if line.starts_with("/new") => {
                let title = line.trim_start_matches("/new").trim();
                let title = (!title.is_empty()).then_some(title);
                match orchestrator.new_session(title) {
                    Ok(id) => println!("  (new session {id})"),
                    Err(e) => println!("  (could not start a session: {e})"),
                }
            }
            _ if line.starts_with('/') => println!("  (unknown command {line})"),
            text => {
                let result = run_cancellable(&mut orchestrator, TurnInput::Text(text.to_string())).await;
                print_outcome(result);
            }
        }
    }

    if let Some(id) = orchestrator.session_id() {
        println!("\nSession saved as {id}");
    }
    Ok(())
}

async fn say(mut orchestrator: TurnOrchestrator, text: String) -> anyhow::Result<()> {
    let outcome = run_cancellable(&mut orchestrator, TurnInput::Text(text)).await?;
    println!("{}", outcome.reply);
    if let Some(error) = &outcome.generation_error {
        tracing::warn!(error = %error, "reply is the fallback apology");
    }
    Ok(())
}

fn list_sessions(store: &SessionStore, limit: usize) -> anyhow::Result<()> {
    let sessions = store.list_sessions(limit)?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  {}  {}",
            session.id,
            session.last_activity.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            session.title
        );
    }
    Ok(())
}

fn show_history(store: &SessionStore, session_id: &str, limit: usize) -> anyhow::Result<()> {
    let Some(session) = store.get_session(session_id)? else {
        anyhow::bail!("no such session: {session_id}");
    };

    println!("{} ({})\n", session.title, session.id);
    for entry in store.get_history(session_id, limit)? {
        println!("[{}]", entry.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
        println!("  you:   {}", entry.user);
        println!("  kamen: {}", entry.bot);
    }
    Ok(())
}

fn delete_session(store: &SessionStore, session_id: &str) -> anyhow::Result<()> {
    if store.get_session(session_id)?.is_none() {
        println!("No such session: {session_id}");
        return Ok(());
    }

    let deleted = store.delete_session(session_id)?;
    println!("Deleted session {session_id} ({deleted} exchanges)");
    Ok(())
}

fn show_stats(store: &SessionStore) -> anyhow::Result<()> {
    let stats = store.stats()?;
    println!("Sessions:         {}", stats.total_sessions);
    println!("Exchanges:        {}", stats.total_exchanges);
    println!("Exchanges today:  {}", stats.exchanges_today);
    Ok(())
}

async fn models(config: &Config, pull: bool) -> anyhow::Result<()> {
    let client = ollama_client(config)?;

    if pull && client.ensure_model_ready().await? {
        println!("Pulled {}", config.llm.model);
    }

    let models = client.list_models().await?;
    println!("Models on {}:", client.host());
    for name in &models {
        let marker = if client.is_configured_model(name) { "*" } else { " " };
        println!(" {marker} {name}");
    }
    if !models.iter().any(|m| client.is_configured_model(m)) {
        println!("\nConfigured model {} is not installed (use --pull)", config.llm.model);
    }
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut capture = AudioCapture::new()?;
        capture.start()?;

        println!(
            "Sample rate: {} Hz, channels: {}",
            capture.sample_rate(),
            capture.channels()
        );
        println!("---");

        for i in 0..duration {
            std::thread::sleep(Duration::from_secs(1));

            let frame = capture.take_frame();
            let energy = calculate_rms(&frame.samples);
            let peak = frame.peak();

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!(
                "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
                i + 1,
                energy,
                peak,
                meter
            );
        }

        capture.stop();
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy of audio samples
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    #[allow(clippy::cast_precision_loss)]
    let len = samples.len() as f32;
    (sum / len).sqrt()
}

/// Test speaker output
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let playback = AudioPlayback::new()?;
        println!("Playing {} samples, device rate {} Hz...", samples.len(), playback.sample_rate());
        playback.play_blocking(AudioFrame::mono(samples, sample_rate), &CancellationToken::new())?;
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
