use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use approxmem::{Engine, FlatMemory, Range, SimulationFile};

#[derive(Debug, Parser)]
#[command(name = "approxmem-replay")]
#[command(about = "Replay a memory access trace against simulated approximate memory")]
struct Cli {
    /// Simulation file with engine, memory, injector and consumption tables
    #[arg(long)]
    config: PathBuf,

    /// Line-oriented access trace
    #[arg(long)]
    trace: PathBuf,

    /// Overrides the seed of the simulation file
    #[arg(long)]
    seed: Option<u64>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum TraceCommand {
    Register {
        range: Range,
        buffer_id: i64,
        config_id: i64,
        element_size: usize,
    },
    Unregister {
        range: Range,
        give_away: bool,
    },
    Write {
        address: u64,
        size: usize,
        data: Option<Vec<u8>>,
    },
    Read {
        address: u64,
        size: usize,
    },
    ScatterRead {
        element_size: usize,
        addresses: Vec<u64>,
    },
    ScatterWrite {
        element_size: usize,
        addresses: Vec<u64>,
    },
    Period(u64),
    Enable,
    Disable,
    Level(i64),
}

fn parse_u64(raw: &str) -> Result<u64> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("invalid number {raw:?}"))
}

fn parse_usize(raw: &str) -> Result<usize> {
    Ok(usize::try_from(parse_u64(raw)?)?)
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    if raw.len() % 2 != 0 {
        bail!("hex payload {raw:?} has an odd number of digits");
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&raw[i..i + 2], 16)
                .with_context(|| format!("invalid hex payload {raw:?}"))
        })
        .collect()
}

fn parse_line(line: &str) -> Result<Option<TraceCommand>> {
    let line = line.split('#').next().unwrap_or_default().trim();
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&op, args)) = words.split_first() else {
        return Ok(None);
    };

    let arg = |i: usize| -> Result<&str> {
        args.get(i)
            .copied()
            .with_context(|| format!("`{op}` is missing argument {}", i + 1))
    };

    let command = match op {
        "register" => TraceCommand::Register {
            range: Range::new(parse_u64(arg(0)?)?, parse_u64(arg(1)?)?)?,
            buffer_id: arg(2)?.parse().context("invalid buffer id")?,
            config_id: arg(3)?.parse().context("invalid configuration id")?,
            element_size: parse_usize(arg(4)?)?,
        },
        "unregister" => TraceCommand::Unregister {
            range: Range::new(parse_u64(arg(0)?)?, parse_u64(arg(1)?)?)?,
            give_away: args.get(2) != Some(&"keep"),
        },
        "write" => TraceCommand::Write {
            address: parse_u64(arg(0)?)?,
            size: parse_usize(arg(1)?)?,
            data: args.get(2).map(|raw| parse_hex_bytes(raw)).transpose()?,
        },
        "read" => TraceCommand::Read {
            address: parse_u64(arg(0)?)?,
            size: parse_usize(arg(1)?)?,
        },
        "scatter-read" | "scatter-write" => {
            let element_size = parse_usize(arg(0)?)?;
            let addresses = args[1..]
                .iter()
                .map(|raw| parse_u64(raw))
                .collect::<Result<Vec<_>>>()?;
            if op == "scatter-read" {
                TraceCommand::ScatterRead {
                    element_size,
                    addresses,
                }
            } else {
                TraceCommand::ScatterWrite {
                    element_size,
                    addresses,
                }
            }
        }
        "period" => TraceCommand::Period(parse_u64(arg(0)?)?),
        "enable" => TraceCommand::Enable,
        "disable" => TraceCommand::Disable,
        "level" => TraceCommand::Level(arg(0)?.parse().context("invalid level delta")?),
        other => bail!("unknown trace command `{other}`"),
    };
    Ok(Some(command))
}

fn apply(engine: &Engine, command: TraceCommand) -> Result<()> {
    match command {
        TraceCommand::Register {
            range,
            buffer_id,
            config_id,
            element_size,
        } => {
            engine.register_buffer(range, buffer_id, config_id, element_size)?;
        }
        TraceCommand::Unregister { range, give_away } => {
            engine.unregister_buffer(range, give_away);
        }
        TraceCommand::Write {
            address,
            size,
            data,
        } => {
            engine.on_write(address, size);
            if let Some(data) = data {
                let stored = engine.with_memory(|memory| {
                    memory
                        .bytes_mut(address, data.len())
                        .map(|bytes| bytes.copy_from_slice(&data))
                        .is_some()
                });
                if !stored {
                    bail!("write payload at {address:#x} falls outside simulated memory");
                }
            }
        }
        TraceCommand::Read { address, size } => engine.on_read(address, size),
        TraceCommand::ScatterRead {
            element_size,
            addresses,
        } => engine.on_scattered_read(&addresses, element_size),
        TraceCommand::ScatterWrite {
            element_size,
            addresses,
        } => engine.on_scattered_write(&addresses, element_size),
        TraceCommand::Period(period) => engine.advance_period(period),
        TraceCommand::Enable => engine.set_injection_enabled(true),
        TraceCommand::Disable => engine.set_injection_enabled(false),
        TraceCommand::Level(delta) => {
            engine.adjust_injection_level(delta);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("approxmem=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut simulation = SimulationFile::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if cli.seed.is_some() {
        simulation.engine.seed = cli.seed;
    }

    let memory = FlatMemory::new(simulation.memory.base, simulation.memory.size);
    let engine = Engine::with_consumption(
        simulation.engine,
        simulation.injectors,
        simulation.consumption,
        Box::new(memory),
    )
    .context("failed to build engine")?;

    let trace = fs::read_to_string(&cli.trace)
        .with_context(|| format!("failed to read trace {}", cli.trace.display()))?;
    let mut replayed = 0usize;
    for (number, line) in trace.lines().enumerate() {
        let command = parse_line(line)
            .with_context(|| format!("{}:{}", cli.trace.display(), number + 1))?;
        if let Some(command) = command {
            apply(&engine, command)
                .with_context(|| format!("{}:{}", cli.trace.display(), number + 1))?;
            replayed += 1;
        }
    }

    let retired = engine.retire_all(true);
    info!(replayed, retired, period = engine.current_period(), "trace replayed");

    let json = engine.report().to_json_pretty()?;
    match &cli.output {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_trace_commands() {
        assert_eq!(parse_line("  # comment").unwrap(), None);
        assert_eq!(
            parse_line("register 0x1000 0x1010 3 1 4").unwrap(),
            Some(TraceCommand::Register {
                range: Range::new(0x1000, 0x1010).unwrap(),
                buffer_id: 3,
                config_id: 1,
                element_size: 4,
            })
        );
        assert_eq!(
            parse_line("write 0x1000 2 0xbeef").unwrap(),
            Some(TraceCommand::Write {
                address: 0x1000,
                size: 2,
                data: Some(vec![0xbe, 0xef]),
            })
        );
        assert_eq!(
            parse_line("unregister 4096 4112 keep").unwrap(),
            Some(TraceCommand::Unregister {
                range: Range::new(0x1000, 0x1010).unwrap(),
                give_away: false,
            })
        );
        assert_eq!(
            parse_line("scatter-read 4 0x1000 0x1008").unwrap(),
            Some(TraceCommand::ScatterRead {
                element_size: 4,
                addresses: vec![0x1000, 0x1008],
            })
        );
        assert_eq!(parse_line("level -1").unwrap(), Some(TraceCommand::Level(-1)));
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert!(parse_line("register 0x1010 0x1000 1 0 4").is_err());
        assert!(parse_line("read 0x1000").is_err());
        assert!(parse_line("write 0x1000 1 abc").is_err());
        assert!(parse_line("jump 0x1000").is_err());
    }
}
