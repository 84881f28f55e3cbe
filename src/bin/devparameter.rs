//! `devparameter` — one-shot single-device parameter operations.
//!
//! CLI shape follows the teacher's own examples (`examples/rtl_fm.rs`):
//! `clap::Parser` for options, `stderrlog` for logging, `anyhow::Result`
//! at the `main()` boundary.

use anyhow::{Context, Result, bail};
use clap::Parser;
use devparam::session::DppeSession;
use devparam::transport::{Addr, ConnectionTarget, Transport, TransportMode, parse_connection_string};
use devparam::types::{self, Parameter, ParameterType};
use std::sync::Arc;
use std::time::Duration;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Read or write named parameters on a single device")]
struct Opt {
    /// Connection string: `sf@host:port` or `serial@port:baud`.
    conn: String,

    /// Active-message group, hex. Omit together with `-a` for serial-raw mode.
    #[arg(short = 'g', long)]
    group: Option<String>,

    /// This node's own active-message address, hex.
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// Target node's address, hex. 0 (the default) means serial-raw.
    #[arg(short = 'd', long, default_value = "0")]
    destination: String,

    /// Per-attempt timeout, in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Additional retries after the first attempt times out.
    #[arg(long, default_value_t = 2)]
    retries: u8,

    /// Parameter name. Repeatable; with none given, enumerate every
    /// parameter on the device instead.
    #[arg(short = 'p', long = "parameter")]
    parameter: Vec<String>,

    /// Value to write, as raw hex bytes.
    #[arg(short = 'v', long)]
    value: Option<String>,

    /// Value to write, as UTF-8 text.
    #[arg(long)]
    str: Option<String>,
    /// Value to write, as an unsigned 8-bit integer.
    #[arg(long)]
    u8: Option<String>,
    /// Value to write, as an unsigned 16-bit integer.
    #[arg(long)]
    u16: Option<String>,
    /// Value to write, as an unsigned 32-bit integer.
    #[arg(long)]
    u32: Option<String>,
    /// Value to write, as an unsigned 64-bit integer.
    #[arg(long)]
    u64: Option<String>,
    /// Value to write, as a signed 8-bit integer.
    #[arg(long)]
    i8: Option<String>,
    /// Value to write, as a signed 16-bit integer.
    #[arg(long)]
    i16: Option<String>,
    /// Value to write, as a signed 32-bit integer.
    #[arg(long)]
    i32: Option<String>,
    /// Value to write, as a signed 64-bit integer.
    #[arg(long)]
    i64: Option<String>,

    /// Suppress all but error output.
    #[arg(short = 'Q', long)]
    quiet: bool,

    /// Increase log verbosity. Repeatable.
    #[arg(short = 'D', long, action = clap::ArgAction::Count)]
    debug: u8,
}

/// Collect whichever single value option (if any) was given, paired with
/// the type it implies. `-v/--value` implies `ParameterType::Raw`.
fn requested_value(opt: &Opt) -> Result<Option<(ParameterType, String)>> {
    let typed: Vec<(ParameterType, &str)> = [
        (ParameterType::Str, &opt.str),
        (ParameterType::Uint8, &opt.u8),
        (ParameterType::Uint16, &opt.u16),
        (ParameterType::Uint32, &opt.u32),
        (ParameterType::Uint64, &opt.u64),
        (ParameterType::Int8, &opt.i8),
        (ParameterType::Int16, &opt.i16),
        (ParameterType::Int32, &opt.i32),
        (ParameterType::Int64, &opt.i64),
    ]
    .into_iter()
    .filter_map(|(ty, v)| v.as_deref().map(|s| (ty, s)))
    .collect();

    let count = typed.len() + usize::from(opt.value.is_some());
    if count > 1 {
        bail!("only one of -v/--str/--u8.. may be given");
    }
    if let Some(v) = &opt.value {
        return Ok(Some((ParameterType::Raw, v.clone())));
    }
    Ok(typed.into_iter().next().map(|(ty, s)| (ty, s.to_string())))
}

fn parse_hex_addr(s: &str) -> Result<Addr> {
    u16::from_str_radix(s, 16).with_context(|| format!("'{s}' is not a valid hex address"))
}

/// Building a real transport (dialing the serial port or TCP forwarder
/// described by `target`) is left to whatever links this library in for
/// production use; it is an explicit external collaborator, not this
/// crate's concern.
fn open_transport(target: &ConnectionTarget, mode: TransportMode) -> Result<Arc<dyn Transport>> {
    let _ = mode;
    bail!(
        "no transport backend is linked into this build for {target:?}; \
         implement devparam::transport::Transport against real serial/TCP-forwarder \
         I/O and wire it in here"
    )
}

fn print_parameter(name: &str, p: &Parameter) {
    println!("{name}\t{}\t{}", p.ty, p.display_value());
}

fn run(opt: &Opt) -> Result<bool> {
    let value = requested_value(opt)?;
    if value.is_some() && opt.parameter.len() != 1 {
        bail!("a value may only be given together with exactly one -p/--parameter");
    }

    let target = parse_connection_string(&opt.conn)?;
    let mode = match (&opt.group, &opt.address) {
        (Some(g), Some(a)) => TransportMode::ActiveMessage {
            group: parse_hex_addr(g)?,
            local: parse_hex_addr(a)?,
        },
        (None, None) => TransportMode::SerialRaw,
        _ => bail!("-g/--group and -a/--address must be given together"),
    };
    let destination = match parse_hex_addr(&opt.destination)? {
        0 => None,
        d => Some(d),
    };
    let transport = open_transport(&target, mode)?;
    let session = DppeSession::new(
        transport,
        destination,
        Duration::from_secs(opt.timeout),
        opt.retries,
    );

    let mut ok = true;
    if opt.parameter.is_empty() {
        for p in session.get_list()? {
            match &p.error {
                None => print_parameter(&p.name, &p),
                Some(e) => {
                    log::warn!("seqnum {}: {e}", p.seqnum);
                    ok = false;
                }
            }
        }
    } else if let Some((ty, text)) = value {
        let name = &opt.parameter[0];
        let bytes = types::parse(ty, &text)?;
        match session.set_value(name, bytes) {
            Ok(p) => print_parameter(name, &p),
            Err(e) => {
                log::error!("failed to set {name}: {e}");
                ok = false;
            }
        }
    } else {
        for name in &opt.parameter {
            match session.get_value(name) {
                Ok(p) => print_parameter(name, &p),
                Err(e) => {
                    log::error!("failed to get {name}: {e}");
                    ok = false;
                }
            }
        }
    }
    Ok(ok)
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("devparam")
        .quiet(opt.quiet)
        .verbosity(usize::from(opt.debug) + 2)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let ok = run(&opt)?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
