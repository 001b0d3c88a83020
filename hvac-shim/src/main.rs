//! hvac-shim — test shim client for the logic core.
//!
//! Connects over the Unix-domain or TCP control socket and exercises the
//! protocol one verb per subcommand. Intended for bring-up and bench
//! testing of boards and of the daemon itself.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use hvaclib::cache::{AI_COUNT, CacheEntry8, CacheEntry16};
use hvaclib::listener::{DEFAULT_SOCKET_PATH, DEFAULT_TCP_INTERFACE, DEFAULT_TCP_PORT, ListenAddr};
use hvaclib::{ClientConnection, Message, MessageType};

/// hvac-shim — control protocol exerciser.
#[derive(Parser)]
#[command(name = "hvac-shim", version, about)]
struct Cli {
    /// Connect over TCP instead of the local Unix-domain socket.
    #[arg(short = 'i')]
    inet: bool,

    /// Address: socket path for Unix-domain, host for TCP.
    #[arg(short = 'a')]
    address: Option<String>,

    /// TCP port; relevant only with -i.
    #[arg(short = 'p', default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

/// Available shim commands.
#[derive(Subcommand)]
enum Commands {
    /// Measure a PING round trip.
    Ping,

    /// Read the packed status snapshot of one board.
    Status {
        /// Board tag.
        board: String,
    },

    /// Dump the raw analog ring of one board.
    RawAi {
        /// Board tag.
        board: String,
    },

    /// List configured labels of one kind (DO, AI, SP, MAP).
    Labels {
        /// Label kind.
        kind: String,
    },

    /// Dump every mapped point as the logic loop sees it.
    LogicStatus,

    /// Set the digital output bits of one board.
    SetDo {
        /// Board tag.
        board: String,
        /// Output bits as one byte.
        bits: u8,
    },

    /// Set the PMIC bits of one board.
    SetPmic {
        /// Board tag.
        board: String,
        /// PMIC bits as one byte.
        bits: u8,
    },

    /// Change a setpoint.
    SetSp {
        /// Setpoint name.
        name: String,
        /// New value.
        value: f64,
    },

    /// Force an analog input to a fixed raw value.
    ForceAi {
        /// Board tag.
        board: String,
        /// Channel index (0-7).
        channel: u8,
        /// Raw ADC value.
        value: u16,
    },

    /// Clear an analog input force.
    UnforceAi {
        /// Board tag.
        board: String,
        /// Channel index (0-7).
        channel: u8,
    },

    /// Write a calibration table (level 1 or 2), one value per channel.
    SetCal {
        /// Board tag.
        board: String,
        /// Calibration level.
        #[arg(value_parser = clap::value_parser!(u8).range(1..=2))]
        level: u8,
        /// Eight packed calibration values.
        #[arg(num_args = 8)]
        vals: Vec<u16>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let addr = if cli.inet {
        ListenAddr::Tcp(
            cli.address
                .clone()
                .unwrap_or_else(|| DEFAULT_TCP_INTERFACE.to_string()),
            cli.port,
        )
    } else {
        ListenAddr::Unix(PathBuf::from(
            cli.address
                .clone()
                .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string()),
        ))
    };

    if let Err(e) = run(&addr, &cli.command) {
        eprintln!("error: {e}");
        std::process::exit(-1);
    }
}

fn run(addr: &ListenAddr, command: &Commands) -> hvaclib::Result<()> {
    let client = ClientConnection::connect(addr)?;

    match command {
        Commands::Ping => {
            let start = std::time::Instant::now();
            client.send(Message::ping())?;

            // The reply is base-handled; poll the inbound ring for it.
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            loop {
                if client.latest_inbound(MessageType::Pong)?.is_some() {
                    println!("PONG in {:?}", start.elapsed());
                    break;
                }
                if std::time::Instant::now() > deadline {
                    eprintln!("no PONG within 2 seconds");
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }

        Commands::Status { board } => {
            let reply = client.send_and_wait(Message::read_status(board))?;
            print_status(&reply);
        }

        Commands::RawAi { board } => {
            let reply = client.send_and_wait(Message::read_raw_analog(board))?;
            for (index, part) in reply.parts().iter().enumerate() {
                let entry = CacheEntry16::from_wire(part);
                match entry {
                    Some(entry) => println!(
                        "[{}/{}] {} @ {}",
                        index / AI_COUNT,
                        index % AI_COUNT,
                        entry.value,
                        entry.stamp
                    ),
                    None => println!("[{index}] unparseable: {part}"),
                }
            }
        }

        Commands::Labels { kind } => {
            let reply = client.send_and_wait(Message::get_labels(kind))?;
            for part in reply.parts() {
                println!("{part}");
            }
        }

        Commands::LogicStatus => {
            let reply = client.send_and_wait(Message::read_logic_status())?;
            for pair in reply.parts().chunks(2) {
                if let [name, value] = pair {
                    println!("{name} = {value}");
                }
            }
        }

        Commands::SetDo { board, bits } => {
            client.send(Message::set_status(board, *bits))?;
            println!("DO bits of {board} set to {bits:#04x}");
        }

        Commands::SetPmic { board, bits } => {
            client.send(Message::set_pmic_status(board, *bits))?;
            println!("PMIC bits of {board} set to {bits:#04x}");
        }

        Commands::SetSp { name, value } => {
            client.send(Message::set_sp(name, *value))?;
            println!("setpoint '{name}' set to {value}");
        }

        Commands::ForceAi {
            board,
            channel,
            value,
        } => {
            client.send(Message::force_ai(board, *channel, *value))?;
            println!("AI {channel} of {board} forced to {value}");
        }

        Commands::UnforceAi { board, channel } => {
            client.send(Message::unforce_ai(board, *channel))?;
            println!("AI {channel} of {board} unforced");
        }

        Commands::SetCal { board, level, vals } => {
            client.send(Message::set_cal_vals(*level, board, vals))?;
            println!("L{level} calibration of {board} written");
        }
    }

    client.disconnect();
    Ok(())
}

/// Renders the packed READ_STATUS reply: 8 AI, DO, PMIC, two calibration
/// tables, boot count.
fn print_status(reply: &Message) {
    let parts = reply.parts();

    for channel in 0..AI_COUNT {
        match parts.get(channel).and_then(|p| CacheEntry16::from_wire(p)) {
            Some(entry) => println!("AI{channel}: {} @ {}", entry.value, entry.stamp),
            None => println!("AI{channel}: <missing>"),
        }
    }

    let byte_at = |index: usize| {
        parts
            .get(index)
            .and_then(|p| CacheEntry8::from_wire(p))
            .map(|e| e.value)
    };
    match byte_at(AI_COUNT) {
        Some(bits) => println!("DO:   {bits:#010b}"),
        None => println!("DO:   <missing>"),
    }
    match byte_at(AI_COUNT + 1) {
        Some(bits) => println!("PMIC: {bits:#010b}"),
        None => println!("PMIC: <missing>"),
    }

    for level in 0..2 {
        let base = AI_COUNT + 2 + level * AI_COUNT;
        let vals: Vec<String> = (0..AI_COUNT)
            .map(|channel| {
                parts
                    .get(base + channel)
                    .and_then(|p| CacheEntry16::from_wire(p))
                    .map(|e| e.value.to_string())
                    .unwrap_or_else(|| "?".to_string())
            })
            .collect();
        println!("CAL L{}: [{}]", level + 1, vals.join(", "));
    }

    match parts
        .get(AI_COUNT + 2 + 2 * AI_COUNT)
        .and_then(|p| CacheEntry16::from_wire(p))
    {
        Some(entry) => println!("boot count: {}", entry.value),
        None => println!("boot count: <missing>"),
    }
}
