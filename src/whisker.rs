use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tracing::{debug, error, info, warn};

const CLIENT_NAME: &str = "Starfeeder";

/// Spawns the Whisker relay task and returns the sender for broadcast
/// lines. The TCP connection is made lazily and re-made after a failure;
/// lines arriving while the server is unreachable are dropped, matching the
/// "broadcast only while connected" behaviour of the lab-control client.
pub fn spawn(host: String, port: u16) -> UnboundedSender<String> {
    let (tx, rx) = unbounded_channel();
    tokio::spawn(run_relay(host, port, rx));
    tx
}

async fn run_relay(host: String, port: u16, mut lines: UnboundedReceiver<String>) {
    let mut stream: Option<TcpStream> = None;
    while let Some(line) = lines.recv().await {
        if stream.is_none() {
            stream = connect(&host, port).await;
        }
        match stream.as_mut() {
            Some(socket) => {
                if let Err(err) = socket.write_all(format!("{line}\n").as_bytes()).await {
                    error!("Whisker write failed: {err}; dropping connection");
                    stream = None;
                }
            }
            None => debug!("Whisker server offline; dropping broadcast: {line}"),
        }
    }
    info!("Whisker relay finished");
}

async fn connect(host: &str, port: u16) -> Option<TcpStream> {
    match TcpStream::connect((host, port)).await {
        Ok(mut socket) => {
            info!("connected to Whisker server at {host}:{port}");
            let hello = format!("ReportName {CLIENT_NAME} {}\n", env!("CARGO_PKG_VERSION"));
            match socket.write_all(hello.as_bytes()).await {
                Ok(()) => Some(socket),
                Err(err) => {
                    warn!("Whisker greeting failed: {err}");
                    None
                }
            }
        }
        Err(err) => {
            warn!("cannot reach Whisker server at {host}:{port}: {err}");
            None
        }
    }
}
