//! Line Echo - a listening socket that echoes every line back.
//!
//! This example demonstrates:
//! - Listening with `TcpSocket::listen`
//! - Giving each accepted connection its own callback
//! - Re-entering a socket from its callback to queue the next read
//!
//! ```text
//! cargo run --example line_echo -- 7000
//! nc localhost 7000
//! ```

use tagsock::{FramingSpec, Socket, SocketEvent, TcpSocket};

fn serve(client: TcpSocket) {
    let conn = client.clone();
    client.set_callback(move |event| match event {
        SocketEvent::DataRead { data, tag, .. } => {
            let _ = conn.write(data, tag.clone());
            let _ = conn.read(FramingSpec::line(), tag);
        }
        // the callback, and the clone it holds, is dropped after this
        SocketEvent::Disconnected { reason } => eprintln!("client gone: {}", reason),
        _ => {}
    });
    if let Err(e) = client.read(FramingSpec::line(), "line") {
        eprintln!("failed to start reading: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u32 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000);

    let server = TcpSocket::new();
    server.set_callback(|event| match event {
        SocketEvent::Accepted { socket, peer } => {
            eprintln!("accepted {:?}", peer);
            serve(socket);
        }
        SocketEvent::Connected => eprintln!("listening"),
        other => eprintln!("{:?}", other),
    });
    server.listen(port)?;

    tokio::signal::ctrl_c().await?;
    server.close();
    Ok(())
}
