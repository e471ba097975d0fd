use std::io;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{debug, info};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use wsprlite_remote::cli::{self, CallOpts, ConsoleOpts};
use wsprlite_remote::console;
use wsprlite_remote::device::{Device, TxListener};
use wsprlite_remote::port::{list_ports, open_port};
use wsprlite_remote::scheduler::SystemClock;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    TermLogger::init(
        args.level,
        simplelog::ConfigBuilder::new().build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("init logger")?;
    debug!("parsed args: {:?}", args);

    match args.cmd {
        cli::Cmd::Ports => {
            for p in list_ports() {
                println!("{}", p);
            }
            Ok(())
        }
        cli::Cmd::Call(opts) => call(opts),
        cli::Cmd::Console(opts) => run_console(opts),
    }
}

fn call(opts: CallOpts) -> Result<()> {
    let op = console::parse_operation(&opts.op.join(" "))?;
    let port = open_port(&opts.ser).context("serial device unavailable")?;
    info!("opened {}", opts.ser.dev);

    let (tx, rx) = unbounded();
    let listener: TxListener = Arc::new(move |edge, reply| {
        let _ = tx.send((edge, reply));
    });
    let mut device = Device::new(port, Arc::new(SystemClock), listener);

    let reply = match device.dispatch(op) {
        Some(reply) => reply,
        None => {
            info!("{} queued, status {}", op.name(), device.status());
            let (edge, reply) = rx.recv().context("scheduler stopped before the transaction ran")?;
            debug!("{} outcome received", edge);
            reply
        }
    };
    device.shutdown();

    println!("{}", reply);
    if !reply.ok {
        bail!("{} failed", op.name());
    }
    Ok(())
}

fn run_console(opts: ConsoleOpts) -> Result<()> {
    let port = open_port(&opts.ser).context("serial device unavailable")?;
    info!("opened {}, reading operations from stdin", opts.ser.dev);

    let listener: TxListener = Arc::new(|edge, reply| println!("{} {}", edge, reply));
    let mut device = Device::new(port, Arc::new(SystemClock), listener);

    let stdin = io::stdin();
    console::run(&device, stdin.lock(), io::stdout()).context("console i/o")?;
    device.shutdown();
    Ok(())
}
