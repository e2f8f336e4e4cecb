//! systemd watchdog pings.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

const PING_INTERVAL: Duration = Duration::from_secs(60);

/// When running under systemd with `NOTIFY_SOCKET` set, send `WATCHDOG=1`
/// over the notify socket every minute. Returns `None` outside systemd.
pub fn spawn() -> Option<JoinHandle<()>> {
    let socket_path = std::env::var("NOTIFY_SOCKET").ok().filter(|s| !s.is_empty())?;

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match UnixDatagram::unbound() {
                Ok(socket) => {
                    if let Err(err) = socket.send_to(b"WATCHDOG=1", &socket_path) {
                        debug!(%err, "watchdog ping failed");
                    }
                }
                Err(err) => debug!(%err, "watchdog socket unavailable"),
            }
        }
    }))
}
