#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    use daemonize::Daemonize;

    eprintln!("[INFO] Starting daemon mode...");

    // Keep the working directory so relative --mailbox/--logs paths resolve.
    let daemonize = Daemonize::new()
        .pid_file("/tmp/smtp-lab.pid")
        .chown_pid_file(true)
        .working_directory(".");

    match daemonize.start() {
        Ok(_) => {
            eprintln!("[INFO] smtp-lab daemon started (PID {})", std::process::id());
            Ok(())
        }
        Err(e) => {
            eprintln!("[ERROR] Daemon startup: {}", e);
            Err(anyhow::anyhow!("Failed to start daemon mode"))
        }
    }
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode not supported on this platform");
    Ok(())
}
