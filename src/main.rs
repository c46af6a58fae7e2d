use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use smtp_lab::server::SmtpServer;
use smtp_lab::{daemon, Opt};

fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("smtp-lab v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    println!("[INFO] PID: {}", std::process::id());
    println!("[INFO] Listening address: {}", opt.address);
    println!("[INFO] Ports: {:?}", opt.ports);
    println!("[INFO] Relay domains: {:?}", opt.domains);
    println!("[INFO] Accounts configured: {}", opt.auth_users.len());
    println!("[INFO] Mailbox root: {:?}", opt.mailbox);
    println!(
        "[INFO] Connection ceilings: {} total, {} per source",
        opt.max_connections, opt.max_per_source
    );
    println!(
        "[INFO] Session timeout: {}s, sweep every {}s",
        opt.session_timeout, opt.sweep_interval
    );

    // Fork before the runtime exists; tokio worker threads do not survive it.
    if opt.daemon {
        daemon::daemonize()?;
    } else {
        println!("[INFO] Waiting for connections...");
        println!("[INFO] Press Ctrl+C to stop");
    }

    tokio::runtime::Runtime::new()?.block_on(serve(opt))
}

async fn serve(opt: Opt) -> Result<()> {
    let server = Arc::new(SmtpServer::new(opt).await?);
    server.run().await
}
