mod parse_args;

use std::io::BufRead;
use std::time::Duration;

use dzrp_protocol::reg;
use zxnext_remote::step::MANUAL_BREAK_REASON;
use zxnext_remote::{Registers, Settings, ZxNextRemote};

use parse_args::parse_args;

fn fmt_registers(regs: &Registers) -> String {
    format!(
        "PC={:04X} SP={:04X} AF={:04X} BC={:04X} DE={:04X} HL={:04X} IX={:04X} IY={:04X}",
        regs.word(reg::PC),
        regs.word(reg::SP),
        regs.word(reg::AF),
        regs.word(reg::BC),
        regs.word(reg::DE),
        regs.word(reg::HL),
        regs.word(reg::IX),
        regs.word(reg::IY),
    )
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error parsing arguments: {}", e);
            std::process::exit(1);
        }
    };

    simple_logger::SimpleLogger::new()
        .with_level(args.verbosity.level_filter())
        .init()
        .expect("logger init");

    let mut settings = Settings::new(args.endpoint());
    if let Some(secs) = args.timeout_secs {
        settings.response_timeout = Duration::from_secs(secs);
    }
    settings.auto_load = args.load.clone();

    eprintln!("Connecting to {}...", settings.endpoint);
    let mut session = match ZxNextRemote::connect(settings) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            std::process::exit(1);
        }
    };
    let caps = session.capabilities();
    eprintln!(
        "Connected to '{}' (breakpoints={}, watchpoints={}, state={}, tbblue={})",
        session.machine(),
        caps.breakpoints(),
        caps.watchpoints(),
        caps.state(),
        caps.tbblue(),
    );

    for addr in &args.breakpoints {
        match session.set_breakpoint(*addr as i64, None, None) {
            Ok(0) => eprintln!("Breakpoint at {:04X}h rejected", addr),
            Ok(id) => eprintln!("Breakpoint {} at {:04X}h", id, addr),
            Err(e) => {
                eprintln!("Failed to set breakpoint at {:04X}h: {}", addr, e);
                std::process::exit(1);
            }
        }
    }

    // Enter pauses the running program.
    let pause = session.pause_handle();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
            if let Err(e) = pause.pause() {
                eprintln!("Pause failed: {}", e);
                break;
            }
        }
    });

    loop {
        match session.resume() {
            Ok(reason) => {
                let line = match session.get_registers() {
                    Ok(regs) => fmt_registers(&regs),
                    Err(e) => format!("registers unavailable: {}", e),
                };
                if reason.is_empty() {
                    println!("Stopped.  {}", line);
                } else {
                    println!("{}  {}", reason, line);
                }
                if reason == MANUAL_BREAK_REASON {
                    break;
                }
            }
            Err(e) => {
                eprintln!("Resume failed: {}", e);
                session.disconnect();
                std::process::exit(1);
            }
        }
    }

    session.disconnect();
}
