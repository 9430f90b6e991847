use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = call_gate_cli::Cli::parse();
    call_gate_cli::run_cli(cli)
}
