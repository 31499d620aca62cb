use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const RELAY_BUF: usize = 16 * 1024;

/// Byte counters carried by the tunnel close event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn wait_idle(last_activity_ms: &AtomicU64, idle: Duration) {
    let idle_ms = idle.as_millis() as u64;
    loop {
        let last = last_activity_ms.load(Ordering::Relaxed);
        let now = now_millis();
        if now.saturating_sub(last) >= idle_ms {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn pump_direction<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    last_activity: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // End of stream on this side: half-close the peer's write half so
            // the opposite direction keeps flowing.
            let _ = writer.shutdown().await;
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        last_activity.store(now_millis(), Ordering::Relaxed);
    }
    Ok(())
}

/// Opaque bidirectional relay between client and upstream. Runs until both
/// directions reach end-of-stream, the idle window elapses with no bytes
/// moving, or shutdown is signalled (with a final grace period so long-lived
/// streams can drain).
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    idle: Duration,
    shutdown_grace: Duration,
    cancel: &CancellationToken,
) -> TunnelOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let up_bytes = AtomicU64::new(0);
    let down_bytes = AtomicU64::new(0);
    let last_activity = AtomicU64::new(now_millis());

    let (client_r, client_w) = tokio::io::split(client);
    let (upstream_r, upstream_w) = tokio::io::split(upstream);

    let pump = async {
        let c2u = pump_direction(client_r, upstream_w, &up_bytes, &last_activity);
        let u2c = pump_direction(upstream_r, client_w, &down_bytes, &last_activity);
        let _ = tokio::join!(c2u, u2c);
    };
    tokio::pin!(pump);

    tokio::select! {
        _ = &mut pump => {}
        _ = wait_idle(&last_activity, idle) => {
            tracing::debug!("tunnel idle timeout");
        }
        _ = cancel.cancelled() => {
            // Deadline for the forced close after the shutdown signal.
            let _ = tokio::time::timeout(shutdown_grace, &mut pump).await;
        }
    }

    TunnelOutcome {
        client_to_upstream: up_bytes.load(Ordering::Relaxed),
        upstream_to_client: down_bytes.load(Ordering::Relaxed),
    }
}
