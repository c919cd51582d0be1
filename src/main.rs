use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::EnvFilter;

use live_orb::audio::{
    AudioClock, CAPTURE_SAMPLE_RATE, CaptureDevice, PLAYBACK_SAMPLE_RATE, PlaybackSink,
    PlaybackUnit, SpectrumTap,
};
use live_orb::config::file::config_file_path;
use live_orb::session::{
    EchoTransport, EventSender, Transport, WebSocketTransport, event_channel,
};
use live_orb::visuals::{JsonSink, LogSink, VisualSink};
use live_orb::voice::{CpalCapture, CpalPlayback, Earcon, Earcons, samples_to_wav};
use live_orb::{
    Command as SessionCommand, Config, ConfigChange, SessionController, SessionEvent,
    SessionRunner, Visualizer, simulate,
};

/// Orb - talk to a live voice model and watch it listen
#[derive(Parser)]
#[command(name = "orb", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write per-tick visual signals to stdout as JSON lines
    #[arg(long)]
    signals: bool,

    /// Live API key; without one the session talks to a local echo
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Websocket URL to use instead of the hosted live API
    #[arg(long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the recording as a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Run a headless session against a synthetic microphone
    Simulate {
        /// Virtual seconds to simulate
        #[arg(short, long, default_value = "5")]
        seconds: f64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,live_orb=info",
        1 => "info,live_orb=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, output } => test_mic(&config, duration, output).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Simulate { seconds } => run_simulation(&config, seconds, cli.signals),
            Command::Config => print_config(&config),
        };
    }

    let transport = select_transport(cli.endpoint, cli.api_key.as_deref());
    live(config, cli.signals, transport).await
}

/// Websocket when an endpoint or key is given, else the loopback echo
fn select_transport(endpoint: Option<String>, api_key: Option<&str>) -> Box<dyn Transport> {
    match (endpoint, api_key) {
        (Some(url), _) => {
            tracing::info!(endpoint = %url, "using custom websocket endpoint");
            Box::new(WebSocketTransport::new(url))
        }
        (None, Some(key)) => Box::new(WebSocketTransport::live(key)),
        (None, None) => {
            tracing::info!("no API key set, echoing captured audio");
            Box::new(EchoTransport::new())
        }
    }
}

/// Run an interactive session on the default devices
#[allow(clippy::future_not_send)]
async fn live(config: Config, signals: bool, transport: Box<dyn Transport>) -> anyhow::Result<()> {
    tracing::info!(
        voice = %config.session.voice,
        language = %config.session.language,
        "starting live session"
    );

    let (tx, rx) = event_channel();
    let input_tap = SpectrumTap::new();
    let output_tap = SpectrumTap::new();

    let playback = CpalPlayback::new(output_tap.clone(), Some(tx.clone()))?;
    let speaker = playback.handle();
    let capture = CpalCapture::new(
        config.audio.capture_buffer_size,
        tx.clone(),
        input_tap.clone(),
    );

    let controller = SessionController::new(
        &config,
        transport,
        Box::new(capture),
        Rc::new(speaker.clone()),
        Box::new(speaker),
        tx.clone(),
    );

    let rng = config
        .visuals
        .seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let visualizer = Visualizer::new(input_tap, output_tap, config.visuals.particle_count, rng);
    let sink: Box<dyn VisualSink> = if signals {
        Box::new(JsonSink::new(std::io::stdout()))
    } else {
        Box::new(LogSink)
    };

    spawn_input(tx.clone());
    let interrupt = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt.send(SessionEvent::Command(SessionCommand::Shutdown));
        }
    });

    eprintln!("Commands: /mic  /reset  /voice NAME  /lang TAG  /rate N  /quit");
    eprintln!("Anything else is sent as a text message.\n");
    tx.send(SessionEvent::Command(SessionCommand::Connect))?;

    let controller = SessionRunner::new(controller, rx, visualizer, sink, &config)
        .run()
        .await;
    drop(playback);

    let stats = controller.stats();
    tracing::info!(
        frames_sent = stats.frames_sent,
        chunks_received = stats.chunks_received,
        interruptions = stats.interruptions,
        "session ended"
    );
    Ok(())
}

/// Read commands from stdin on a dedicated thread
///
/// Blocking reads on a plain thread do not hold up runtime shutdown.
fn spawn_input(tx: EventSender) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(&line) {
                Ok(Some(command)) => {
                    if tx.send(SessionEvent::Command(command)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => eprintln!("{message}"),
            }
        }
    });
}

/// Map one line of user input to a session command
fn parse_line(line: &str) -> Result<Option<SessionCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(SessionCommand::SendText(line.to_string())));
    };

    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(n, a)| (n, a.trim()));

    let command = match (name, arg) {
        ("mic" | "m", _) => SessionCommand::ToggleCapture,
        ("reset", _) => SessionCommand::Reset,
        ("quit" | "q", _) => SessionCommand::Shutdown,
        ("voice", voice) if !voice.is_empty() => {
            SessionCommand::Configure(ConfigChange::Voice(voice.to_string()))
        }
        ("lang", tag) if !tag.is_empty() => {
            SessionCommand::Configure(ConfigChange::Language(tag.to_string()))
        }
        ("rate", rate) => rate
            .parse()
            .map(|r| SessionCommand::Configure(ConfigChange::SpeakingRate(r)))
            .map_err(|_| format!("not a speaking rate: {rate:?}"))?,
        _ => return Err(format!("unknown command: {line}")),
    };
    Ok(Some(command))
}

async fn test_mic(config: &Config, duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = event_channel();
    let mut capture = CpalCapture::new(config.audio.capture_buffer_size, tx, SpectrumTap::new());
    capture.start()?;

    println!("Sample rate: {CAPTURE_SAMPLE_RATE} Hz");
    println!("---");

    let mut recording = Vec::new();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::CaptureFrame(frame) = event {
                samples.extend(frame);
            }
        }

        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        recording.extend(samples);
    }

    capture.stop();

    if let Some(path) = output {
        std::fs::write(&path, samples_to_wav(&recording, CAPTURE_SAMPLE_RATE)?)?;
        println!("\nSaved {} samples to {}", recording.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play both earcons and a tone on the scheduled output path
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a click, a chime, then a 440Hz tone for 2 seconds\n");

    let playback = CpalPlayback::new(SpectrumTap::new(), None)?;
    let mut speaker = playback.handle();
    let earcons = Earcons::new(PLAYBACK_SAMPLE_RATE);

    #[allow(clippy::cast_precision_loss)]
    let tone: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE * 2)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let now = speaker.now();
    speaker.schedule(now, earcons.get(Earcon::Click))?;
    speaker.schedule(now + 0.4, earcons.get(Earcon::Sent))?;
    speaker.schedule(now + 0.8, &PlaybackUnit::mono(tone, PLAYBACK_SAMPLE_RATE))?;

    while speaker.voice_count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(playback);

    println!("Playback complete");
    Ok(())
}

fn run_simulation(config: &Config, seconds: f64, signals: bool) -> anyhow::Result<()> {
    let mut json;
    let mut log = LogSink;
    let sink: &mut dyn VisualSink = if signals {
        json = JsonSink::new(std::io::stdout().lock());
        &mut json
    } else {
        &mut log
    };

    let report = simulate::run(config, seconds, sink)?;

    eprintln!("Simulated {seconds:.1}s ({} ticks)", report.ticks);
    eprintln!("  final state:      {}", report.final_state);
    eprintln!("  frames sent:      {}", report.stats.frames_sent);
    eprintln!("  chunks received:  {}", report.stats.chunks_received);
    eprintln!("  chunks rejected:  {}", report.stats.chunks_rejected);
    eprintln!("  audio rendered:   {:.3}s", report.rendered);
    eprintln!("  watermark:        {:.3}s", report.watermark);
    eprintln!("  peak input vol:   {:.1}", report.peak_input_volume);
    eprintln!("  peak output vol:  {:.1}", report.peak_output_volume);
    eprintln!("  peak scale:       {:.3}", report.peak_scale);
    Ok(())
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    match config_file_path() {
        Some(path) if path.exists() => println!("# loaded from {}", path.display()),
        Some(path) => println!("# no file at {}; defaults and env only", path.display()),
        None => println!("# no config directory; defaults and env only"),
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_commands() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(
            parse_line(" hello there "),
            Ok(Some(SessionCommand::SendText("hello there".to_string())))
        );
        assert_eq!(parse_line("/mic"), Ok(Some(SessionCommand::ToggleCapture)));
        assert_eq!(parse_line("/q"), Ok(Some(SessionCommand::Shutdown)));
        assert_eq!(
            parse_line("/voice Lyra"),
            Ok(Some(SessionCommand::Configure(ConfigChange::Voice(
                "Lyra".to_string()
            ))))
        );
        assert_eq!(
            parse_line("/rate 1.25"),
            Ok(Some(SessionCommand::Configure(ConfigChange::SpeakingRate(
                1.25
            ))))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("/rate fast").is_err());
        assert!(parse_line("/voice").is_err());
        assert!(parse_line("/dance").is_err());
    }

    #[test]
    fn test_rms() {
        assert!(calculate_rms(&[]).abs() < f32::EPSILON);
        assert!((calculate_rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
