mod args;
mod simulate_command;

use seqlock::Result;
pub use args::{Args, Command};

pub fn run(args: Args) -> Result<()> {
    match args.command {
        cmd @ Command::Simulate { .. } => simulate_command::execute_simulate(cmd, args.quiet),
    }
}
