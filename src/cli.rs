use clap::{Args, Parser, Subcommand};
use simplelog::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "wsprlite-remote", about = "Remote control for a WSPRlite beacon over its serial link")]
pub struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub level: LevelFilter,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// List serial ports
    Ports,
    /// Run a single operation, e.g. `call get-freq` or `call set-band 20`
    Call(CallOpts),
    /// Read operations from stdin, one per line, and print each reply
    Console(ConsoleOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Request RTS/CTS flow control
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CallOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Operation name followed by its argument, if any
    #[arg(required = true, num_args = 1..)]
    pub op: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ConsoleOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
}
