pub mod codec;
pub mod daemon;
pub mod mailbox;
pub mod policy;
pub mod registry;
pub mod server;
pub mod session;
pub mod utils;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-lab",
    about = "A deliberately misconfigured SMTP relay for security training labs",
    version = "0.1.0"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Listening ports (can be specified multiple times, default: 25)
    #[structopt(short = "p", long = "port", default_value = "25", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Hostname used in the greeting, EHLO block and trace headers
    #[structopt(long = "helo", default_value = "lab.local")]
    pub helo: String,

    /// Domain(s) eligible for unauthenticated relay (can be specified multiple times, required)
    #[structopt(long = "domain", required = true, number_of_values = 1)]
    pub domains: Vec<String>,

    /// Account(s) accepted by AUTH, as user:secret (can be specified multiple times)
    #[structopt(long = "auth-user", number_of_values = 1)]
    pub auth_users: Vec<String>,

    /// Mailbox root directory; messages land in <root>/inbox
    #[structopt(long = "mailbox", default_value = "mailbox", parse(from_os_str))]
    pub mailbox: PathBuf,

    /// File whose first line replaces the default 220 banner
    #[structopt(long = "banner-file", parse(from_os_str))]
    pub banner_file: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Maximum concurrent connections overall (default: 10)
    #[structopt(long = "max-connections", default_value = "10")]
    pub max_connections: usize,

    /// Maximum concurrent connections per source IP (default: 3)
    #[structopt(long = "max-per-source", default_value = "3")]
    pub max_per_source: usize,

    /// Seconds of inactivity before a session is evicted (default: 300)
    #[structopt(long = "session-timeout", default_value = "300")]
    pub session_timeout: u64,

    /// Seconds between idle-eviction sweeps (default: 30)
    #[structopt(long = "sweep-interval", default_value = "30")]
    pub sweep_interval: u64,

    /// Maximum message size in bytes, advertised via EHLO SIZE
    #[structopt(long = "max-message-size", default_value = "1048576")]
    pub max_message_size: usize,

    /// Verbose mode - log stored message bodies
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Disable console filtering of control characters - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}
