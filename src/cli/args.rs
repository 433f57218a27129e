use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "seqlock",
    version,
    about = "Fair distributed locking over ephemeral sequential nodes",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (-v info, -vv debug)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run contenders against an in-memory store and report the order they held the lock
    Simulate {
        /// Number of contending processes
        #[arg(short = 'n', long, value_name = "N", default_value_t = 3)]
        contenders: usize,

        /// Lock root path
        #[arg(long, value_name = "PATH", default_value = "/lock")]
        root: String,

        /// Shortest hold time (e.g., "10ms", "1s")
        #[arg(long, value_name = "DURATION", default_value = "10ms")]
        min_hold: String,

        /// Longest hold time
        #[arg(long, value_name = "DURATION", default_value = "50ms")]
        max_hold: String,

        /// Give up waiting after this long
        #[arg(short = 't', long, value_name = "DURATION")]
        timeout: Option<String>,

        /// Fail immediately if someone is ahead in the queue
        #[arg(long, conflicts_with = "timeout")]
        no_wait: bool,

        /// Expire the first holder's session instead of releasing
        #[arg(long)]
        expire_holder: bool,
    },
}
