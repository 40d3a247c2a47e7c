//! TCP front end: one task and one [`Session`] per accepted connection.

use crate::codec::DeviceCodec;
use crate::config::SimConfig;
use crate::session::Session;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tracing::Instrument;

/// Pause after an accept error before trying again.
///
/// A connection torn down before it was accepted costs nothing to retry;
/// anything else (descriptor or memory exhaustion) gets time to drain.
pub fn accept_backoff(error: &std::io::Error) -> Option<Duration> {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted => None,
        _ => Some(Duration::from_millis(100)),
    }
}

/// Accept connections forever. Accept errors are logged and retried.
pub async fn serve(listener: TcpListener, config: Arc<SimConfig>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, provisioning = ?config.provisioning, "device simulator listening");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                if let Some(delay) = accept_backoff(&e) {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
        };
        let config = Arc::clone(&config);
        tokio::spawn(
            async move {
                tracing::info!("session opened");
                let session = Session::new(config.secure_element());
                if let Err(e) = run_session(stream, session, config.max_line_bytes).await {
                    tracing::warn!(error = %e, "session ended with I/O error");
                }
                tracing::info!("session closed");
            }
            .instrument(tracing::info_span!("session", %peer)),
        );
    }
}

/// Bind `config.listen_addr` and serve in a background task.
///
/// Returns the bound address, which differs from the configured one when
/// port 0 was requested.
pub async fn spawn(config: SimConfig) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let addr = listener.local_addr()?;
    let config = Arc::new(config);
    tokio::spawn(serve(listener, config));
    Ok(addr)
}

/// Drive one session over a byte stream until the peer hangs up or the
/// session terminates.
pub async fn run_session<S>(
    stream: S,
    mut session: Session,
    max_line_bytes: usize,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, DeviceCodec::new(max_line_bytes));

    while let Some(command) = framed.next().await {
        let outcome = session.handle(command?);
        let terminal = outcome.is_terminal();
        framed.send(outcome.into_response()).await?;
        if terminal {
            break;
        }
    }

    Ok(())
}
