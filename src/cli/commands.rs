use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::{
    atr::{Atr, TS_DIRECT, TS_INVERSE},
    clock::plan_clocks,
    config::{Config, ReaderConfig, ReaderType},
    dispatch::{CmdPacket, EmmPacket},
    ecm::{AnswerCode, AnswerSink, EcmAnswer, EcmRequest},
    history::DispatchHistory,
    pcsc_transport::{list_readers, PcscTransport},
    session::ReaderSession,
    transport::init_locks,
    utils::{describe_status_word, format_hex_dump, format_hex_spaced, parse_hex},
    worker::ReaderHandle,
};
use crate::systems::default_registry;

#[derive(Parser)]
#[command(name = "cardreader")]
#[command(about = "Smartcard reader lifecycle driver for conditional-access clients")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Show the clocks a reader would run at
    Clock {
        /// Reader type (internal, smart, smargo, mouse, pcsc)
        #[arg(short = 't', long = "type", default_value = "smart")]
        reader_type: ReaderType,

        /// Requested card clock in hundredths of MHz
        #[arg(long, default_value_t = 357)]
        cardmhz: u16,

        /// Requested interface clock in hundredths of MHz
        #[arg(long, default_value_t = 357)]
        mhz: u16,

        /// Set-top box model, for internal readers
        #[arg(long)]
        boxtype: Option<String>,
    },

    /// Decode an ATR given in hex
    Atr {
        /// ATR bytes in hex format (e.g., "3B 02 14 50")
        atr: String,
    },

    /// Start a reader from a configuration file and drive it
    Run {
        /// JSON configuration file
        config: PathBuf,

        /// Reader label (defaults to the first configured reader)
        #[arg(short, long)]
        reader: Option<String>,

        /// Script of reader commands, one per line
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Continue on errors
        #[arg(short, long)]
        continue_on_error: bool,

        /// Write the dispatch history to this file as JSON
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::List { detailed } => cmd_list(detailed),
        Commands::Clock {
            reader_type,
            cardmhz,
            mhz,
            boxtype,
        } => cmd_clock(reader_type, cardmhz, mhz, boxtype.as_deref()),
        Commands::Atr { atr } => cmd_atr(&atr),
        Commands::Run {
            config,
            reader,
            script,
            continue_on_error,
            history,
        } => cmd_run(
            &config,
            reader.as_deref(),
            script.as_deref(),
            continue_on_error,
            history.as_deref(),
        ),
    }
}

fn cmd_list(detailed: bool) -> Result<()> {
    init_locks();
    let readers = list_readers().context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.card_present {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if let Some(ref atr) = reader_info.atr {
            println!(
                "  [{}] {} [CARD - ATR: {}]",
                i,
                reader_info.name,
                format_hex_spaced(atr)
            );
        } else if reader_info.card_present {
            println!("  [{}] {} [CARD]", i, reader_info.name);
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

fn cmd_clock(reader_type: ReaderType, cardmhz: u16, mhz: u16, boxtype: Option<&str>) -> Result<()> {
    let config = ReaderConfig {
        reader_type,
        cardmhz,
        mhz,
        ..Default::default()
    };
    let clocks = plan_clocks(&config, boxtype.unwrap_or(""));

    println!("Reader type: {reader_type}");
    println!(
        "Card clock: {} ({:.2} MHz)",
        clocks.cardmhz,
        clocks.cardmhz as f32 / 100.0
    );
    println!(
        "Interface clock: {} ({:.2} MHz)",
        clocks.mhz,
        clocks.mhz as f32 / 100.0
    );
    println!("Source: {:?}", clocks.source);

    Ok(())
}

fn cmd_atr(atr_hex: &str) -> Result<()> {
    let atr = Atr::new(parse_hex(atr_hex).context("Failed to parse ATR")?);
    if atr.is_empty() {
        bail!("Empty ATR");
    }

    println!("ATR: {atr}");
    println!("Length: {}", atr.len());
    let convention = match atr.as_bytes()[0] {
        TS_DIRECT => "direct",
        TS_INVERSE => "inverse",
        _ => "invalid",
    };
    println!("Convention: {convention}");
    match atr.historical_bytes() {
        Some(historical) if historical.is_empty() => println!("Historical bytes: (none)"),
        Some(historical) => println!("Historical bytes: {}", format_hex_spaced(historical)),
        None => println!("Historical bytes: (truncated ATR)"),
    }
    println!(
        "Card systems: {}",
        default_registry().names().join(", ")
    );

    Ok(())
}

/// Prints ECM answers as the worker delivers them
struct PrintAnswerSink;

impl AnswerSink for PrintAnswerSink {
    fn write_ecm_answer(
        &mut self,
        reader: &str,
        request: &EcmRequest,
        answer: &EcmAnswer,
        elapsed: Duration,
    ) {
        println!(
            "  [{reader}] ECM {:04X}:{:06X}:{:04X} -> {:?} ({}ms)",
            request.caid,
            request.prid,
            request.srvid,
            answer.rc,
            elapsed.as_millis()
        );
        if answer.rc == AnswerCode::Found {
            println!("  CW: {}", format_hex_spaced(&answer.cw));
        }
        if !answer.msglog.is_empty() {
            println!("  {}", answer.msglog);
        }
    }
}

fn cmd_run(
    config_path: &Path,
    label: Option<&str>,
    script: Option<&Path>,
    continue_on_error: bool,
    history_out: Option<&Path>,
) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration: {}", config_path.display()))?;

    let readers: Vec<ReaderConfig> = match label {
        Some(label) => vec![config
            .reader(label)
            .with_context(|| format!("Reader '{label}' not found in configuration"))?
            .clone()],
        None => config.readers.iter().filter(|r| r.enabled).cloned().collect(),
    };
    if readers.is_empty() {
        bail!("No enabled readers configured");
    }

    // Read the script up front so a bad path never touches the device
    let lines = match script {
        Some(path) => read_script(path)?,
        None => vec![(1, "health".to_string()), (2, "status".to_string())],
    };

    init_locks();
    let registry = Arc::new(default_registry());
    let mut handles = Vec::with_capacity(readers.len());
    for reader_config in readers {
        let session = ReaderSession::new(
            reader_config,
            Box::new(PcscTransport::new()),
            Arc::clone(&registry),
        )
        .with_boxtype(config.boxtype());
        let handle = ReaderHandle::spawn(session, Box::new(PrintAnswerSink))
            .context("Failed to start reader")?;
        println!("Reader: {}", handle.label());
        handles.push(handle);
    }
    if let Some(path) = script {
        println!("Executing script: {}", path.display());
    }
    println!();

    let mut errors = 0;
    for (line_number, line) in &lines {
        println!("Line {line_number}: {line}");
        for handle in &handles {
            match execute_line(handle, line) {
                Ok(message) => println!("  [{}] {message}", handle.label()),
                Err(e) => {
                    errors += 1;
                    println!("  [{}] ERROR: {e}", handle.label());
                    if !continue_on_error {
                        bail!(
                            "Script execution stopped due to error on line {}",
                            line_number
                        );
                    }
                }
            }
        }
        println!();
    }

    let mut history = DispatchHistory::new();
    for handle in handles {
        history.merge(handle.shutdown());
    }
    print_statistics(&history);
    if errors > 0 {
        println!("Errors encountered: {errors}");
    }

    if let Some(path) = history_out {
        let json = history.export_json()?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write history: {}", path.display()))?;
        println!("History written to {}", path.display());
    }

    Ok(())
}

/// Non-empty, non-comment script lines with their line numbers
fn read_script(path: &Path) -> Result<Vec<(usize, String)>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open script file: {}", path.display()))?;

    let mut lines = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read line from script")?;
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        lines.push((i + 1, line.to_string()));
    }
    Ok(lines)
}

fn execute_line(handle: &ReaderHandle, line: &str) -> Result<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let arg = |i: usize, what: &str| {
        parts
            .get(i)
            .copied()
            .with_context(|| format!("Missing {what} for {} command", parts[0]))
    };

    match parts[0].to_lowercase().as_str() {
        "health" => {
            handle.check_health()?;
            // a detected card queues its reset behind this status request
            let status = handle.status()?;
            Ok(format!("Health checked, card {status}"))
        }
        "reset" => {
            handle.reset()?;
            Ok("Reset queued".to_string())
        }
        "info" => {
            handle.card_info()?;
            Ok("Card info queued".to_string())
        }
        "poll" => {
            handle.poll_status()?;
            Ok("Status poll queued".to_string())
        }
        "status" => Ok(format!("Status: {}", handle.status()?)),
        "wait" => {
            let ms: u64 = arg(1, "duration")?
                .parse()
                .context("Invalid wait duration")?;
            thread::sleep(Duration::from_millis(ms));
            Ok(format!("Waited {ms}ms"))
        }
        "ecm" => {
            let caid = parse_id16(arg(1, "caid")?)?;
            let provid = parse_id(arg(2, "provid")?)?;
            let srvid = parse_id16(arg(3, "srvid")?)?;
            let ecm = parse_hex(arg(4, "ECM data")?)?;
            handle.ecm(EcmRequest::new(caid, provid, srvid, ecm))?;
            // the answer is printed by the sink once the worker gets to it
            let status = handle.status()?;
            Ok(format!("ECM done, card {status}"))
        }
        "emm" => {
            let emm = parse_hex(arg(1, "EMM data")?)?;
            let result = handle.emm(EmmPacket::new(emm))?;
            Ok(format!("EMM: {result:?}"))
        }
        "raw" => {
            let command = parse_hex(arg(1, "command")?)?;
            let (result, packet) = handle.rawcmd(CmdPacket::new(command))?;
            result
                .check()
                .with_context(|| format!("Raw command failed on {}", handle.label()))?;
            let mut message = format!("Raw: {result:?}");
            if let [.., sw1, sw2] = packet.response[..] {
                message.push_str(&format!(
                    "\n  Response:\n{}\n  Status: {sw1:02X} {sw2:02X} ({})",
                    format_hex_dump(&packet.response),
                    describe_status_word(sw1, sw2)
                ));
            }
            Ok(message)
        }
        _ => bail!("Unknown command: {}", parts[0]),
    }
}

/// Hex identifier, with or without a 0x prefix
fn parse_id(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("Invalid identifier: {s}"))
}

fn parse_id16(s: &str) -> Result<u16> {
    u16::try_from(parse_id(s)?).with_context(|| format!("Identifier out of range: {s}"))
}

fn print_statistics(history: &DispatchHistory) {
    let stats = history.statistics();
    println!("Dispatched: {} ({} ECM, {} EMM, {} raw)", stats.total, stats.ecm, stats.emm, stats.raw);
    if stats.total > 0 {
        println!(
            "Successful: {}, failed: {}, average {}ms",
            stats.successful, stats.failed, stats.average_duration_ms
        );
    }
}
