const HELP: &str = "\
zxnext-remote - DZRP remote bridge

Connects to a ZX Spectrum Next (or emulator) speaking DZRP, optionally
loads a snapshot, installs breakpoints and runs the program, printing
every break reason. Press Enter to pause; a manual pause exits.

USAGE:
  zxnext-remote [OPTIONS]

OPTIONS:
  -h, --help            Prints help information
  --tcp <host:port>     TCP endpoint (default: 127.0.0.1:12000)
  --serial <device>     Serial device instead of TCP
  --baud <rate>         Serial baud rate (default: 921600)
  --ws <url>            WebSocket endpoint instead of TCP
  --load <file>         Load a .sna/.nex snapshot after connecting
  -b, --breakpoint <addr>  Set initial breakpoint (hex address)
  --timeout <secs>      Response timeout in seconds (default: 3)
  -v, --verbose         Show protocol events
  -vv, --trace          Show every frame as hex
";

const DEFAULT_TCP: &str = "127.0.0.1:12000";
const DEFAULT_BAUD: u32 = 921_600;

/// Verbosity level for debug output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Verbose,
    Trace,
}

impl Verbosity {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Quiet => log::LevelFilter::Warn,
            Verbosity::Verbose => log::LevelFilter::Debug,
            Verbosity::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug)]
pub struct AppArgs {
    pub tcp: Option<String>,
    pub serial: Option<String>,
    pub baud: u32,
    pub ws: Option<String>,
    pub load: Option<std::path::PathBuf>,
    pub breakpoints: Vec<u16>,
    pub timeout_secs: Option<u64>,
    pub verbosity: Verbosity,
}

impl AppArgs {
    pub fn endpoint(&self) -> dzrp_protocol::Endpoint {
        if let Some(device) = &self.serial {
            dzrp_protocol::Endpoint::Serial {
                device: device.clone(),
                baud: self.baud,
            }
        } else if let Some(url) = &self.ws {
            dzrp_protocol::Endpoint::WebSocket(url.clone())
        } else {
            dzrp_protocol::Endpoint::Tcp(
                self.tcp.clone().unwrap_or_else(|| DEFAULT_TCP.to_string()),
            )
        }
    }
}

pub fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let breakpoints: Vec<u16> = pargs.values_from_fn(["-b", "--breakpoint"], |s| {
        u16::from_str_radix(s.trim_start_matches("0x"), 16)
    })?;

    let verbosity = if pargs.contains("--trace") || pargs.contains("-vv") {
        Verbosity::Trace
    } else if pargs.contains(["-v", "--verbose"]) {
        Verbosity::Verbose
    } else {
        Verbosity::Quiet
    };

    let args = AppArgs {
        tcp: pargs.opt_value_from_str("--tcp")?,
        serial: pargs.opt_value_from_str("--serial")?,
        baud: pargs.opt_value_from_str("--baud")?.unwrap_or(DEFAULT_BAUD),
        ws: pargs.opt_value_from_str("--ws")?,
        load: pargs.opt_value_from_str("--load")?,
        breakpoints,
        timeout_secs: pargs.opt_value_from_str("--timeout")?,
        verbosity,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}
