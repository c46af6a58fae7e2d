use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::Mutex;

/// Keeps only printable ASCII and ordinary whitespace; attacker-controlled
/// bytes must not reach the operator's terminal unfiltered.
pub fn filter_printable(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Escapes control characters so logged protocol traffic stays one line.
pub fn escape_control(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x1f' | '\x7f' => result.push_str(&format!("\\x{:02x}", c as u32)),
            _ => result.push(c),
        }
    }
    result
}

/// Timestamped activity log: always to stdout, optionally appended to a
/// file. Console output is filtered unless raw mode was requested; the file
/// always receives the escaped form.
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    raw: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw: bool) -> anyhow::Result<Self> {
        let writer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Arc::new(Mutex::new(BufWriter::new(file))))
            }
            None => None,
        };
        Ok(Self { writer, raw })
    }

    pub async fn log(&self, peer: &SocketAddr, message: &str) {
        self.write(&format!("{}", peer), message).await;
    }

    /// Events not tied to one connection (listeners, sweeper).
    pub async fn log_server(&self, message: &str) {
        self.write("server", message).await;
    }

    async fn write(&self, scope: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let console = if self.raw {
            message.to_string()
        } else {
            filter_printable(message)
        };
        println!("{} {} {}", timestamp, scope, console);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let line = format!("{} {} {}\n", timestamp, scope, escape_control(message));
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}
