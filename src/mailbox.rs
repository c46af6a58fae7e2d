use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;

/// A finalized mail transaction, handed over by the session on the body
/// terminator. Immutable from here on.
#[derive(Debug, PartialEq)]
pub struct Delivery {
    pub from: String,
    pub recipients: Vec<String>,
    pub body: Vec<String>,
}

impl Delivery {
    pub fn body_size(&self) -> usize {
        // Joined with CRLF, the size the artifact will carry.
        let newlines = self.body.len().saturating_sub(1) * 2;
        self.body.iter().map(String::len).sum::<usize>() + newlines
    }
}

/// One file per accepted message under `<root>/inbox/`, trace header first,
/// then the raw body. Concurrent deliveries write distinct files.
pub struct Mailbox {
    inbox: PathBuf,
    max_message_size: usize,
}

impl Mailbox {
    pub async fn open(root: PathBuf, max_message_size: usize) -> Result<Self> {
        let inbox = root.join("inbox");
        tokio::fs::create_dir_all(&inbox)
            .await
            .with_context(|| format!("Failed to create mailbox directory: {:?}", inbox))?;
        Ok(Self {
            inbox,
            max_message_size,
        })
    }

    /// Persists one delivery; the filename combines the delivery time with
    /// the peer's ephemeral port. Collision-tolerant, not collision-proof.
    pub async fn deliver(
        &self,
        peer: SocketAddr,
        hostname: &str,
        delivery: &Delivery,
    ) -> Result<PathBuf> {
        if delivery.body_size() > self.max_message_size {
            bail!(
                "message of {} bytes exceeds the {} byte ceiling",
                delivery.body_size(),
                self.max_message_size
            );
        }

        let now = Utc::now();
        let mut content = format!(
            "Received: from client ({}) (envelope-from <{}>)\r\n",
            peer.ip(),
            delivery.from
        );
        content.push_str(&format!("    by {} (smtp-lab) with SMTP\r\n", hostname));
        content.push_str(&format!(
            "    for {}; {}\r\n",
            delivery.recipients.join(", "),
            now.format("%a, %d %b %Y %H:%M:%S +0000")
        ));
        content.push_str(&delivery.body.join("\r\n"));

        let filename = format!("{}_{}.eml", now.format("%Y%m%d_%H%M%S"), peer.port());
        let filepath = self.inbox.join(filename);
        tokio::fs::write(&filepath, content)
            .await
            .with_context(|| format!("Failed to write message to {:?}", filepath))?;
        Ok(filepath)
    }
}
