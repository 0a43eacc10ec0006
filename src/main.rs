//! SOCKS5 CONNECT dispatcher with outbound interface load balancing.
//!
//! `ifdispatch [--bind=host:port]... addr@metric [addr@metric ...]`

mod addr;
mod balancer;
mod connection;
mod error;
mod event;
mod listener;
mod slab;
mod socket;
mod socks;
mod supervisor;

use clap::Parser;

use error::{Error, ErrorKind};
use supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "ifdispatch", disable_help_flag = true, disable_version_flag = true)]
struct Args {
    /// Additional SOCKS5 listen endpoint (repeatable). Defaults to
    /// 127.0.0.1:1080 and [::1]:1080 when omitted.
    #[arg(long = "bind")]
    bind: Vec<String>,

    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    help: bool,

    /// `addr@metric` tokens, one per outbound source interface.
    interfaces: Vec<String>,
}

fn print_usage() {
    println!("Usage: ifdispatch [--bind=host:port]... addr@metric [addr@metric ...]");
    println!();
    println!("  --bind=host:port   additional SOCKS5 listen endpoint (repeatable)");
    println!("  addr@metric        outbound source address and its capacity metric (>=1)");
    println!("  -h, --help         print this message");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IFDISPATCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.help {
        print_usage();
        // clap defaults --help to exit code 0; this CLI's contract requires 1.
        std::process::exit(1);
    }

    if let Err(e) = run(args) {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> error::Result<()> {
    let mut supervisor = Supervisor::new()?;

    if args.interfaces.is_empty() {
        return Err(Error::new(
            ErrorKind::Generic,
            "at least one addr@metric interface is required",
        ));
    }
    for token in &args.interfaces {
        let (addr_part, metric_part) = token
            .split_once('@')
            .ok_or_else(|| Error::invalid_address(format!("missing '@metric' in '{token}'")))?;
        let host = addr::parse_host(addr_part)?;
        let metric: u32 = metric_part
            .parse()
            .map_err(|_| Error::invalid_address(format!("invalid metric in '{token}'")))?;
        if metric < 1 {
            return Err(Error::invalid_address(format!(
                "metric must be >= 1 in '{token}'"
            )));
        }
        supervisor.add_interface(host, metric);
    }

    if args.bind.is_empty() {
        supervisor.bind(addr::parse_socket("127.0.0.1:1080")?)?;
        supervisor.bind(addr::parse_socket("[::1]:1080")?)?;
    } else {
        for b in &args.bind {
            supervisor.bind(addr::parse_socket(b)?)?;
        }
    }

    supervisor.run()
}
