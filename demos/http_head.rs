//! HTTP HEAD - fetch response headers with one delimiter read.
//!
//! This example demonstrates:
//! - Connecting a `TcpSocket` and chaining a tagged write and read
//! - Framing the response headers by the blank line that ends them
//! - Waiting for the outcome through the event callback
//!
//! ```text
//! cargo run --example http_head -- example.com
//! ```

use std::time::Duration;

use tagsock::{Socket, SocketConfig, SocketEvent, TcpSocket};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let host = std::env::args().nth(1).unwrap_or_else(|| "example.com".to_string());

    let socket = TcpSocket::with_config(SocketConfig::default().with_timeout(Some(Duration::from_secs(10))));
    let (tx, mut rx) = mpsc::unbounded_channel();
    socket.set_callback(move |event| {
        let _ = tx.send(event);
    });

    let request = format!("HEAD / HTTP/1.0\r\nHost: {}\r\n\r\n", host);
    socket
        .connect(&host, 80)?
        .write(request, "request")?
        .read("\r\n\r\n", "headers")?;

    while let Some(event) = rx.recv().await {
        match event {
            SocketEvent::Connected => eprintln!("connected to {}", host),
            SocketEvent::WriteComplete { tag } => eprintln!("sent {}", tag),
            SocketEvent::DataRead { data, .. } => {
                print!("{}", String::from_utf8_lossy(&data));
                socket.close();
            }
            SocketEvent::Error { reason, tag } => {
                eprintln!("error ({}): {}", tag.unwrap_or_default(), reason);
            }
            SocketEvent::Disconnected { .. } => break,
            SocketEvent::Accepted { .. } => {}
        }
    }
    Ok(())
}
