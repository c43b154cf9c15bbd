use ingest_core::SessionState;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LivenessConfig;
use crate::transport::{FrameWriter, LinkState, LinkStatus};

/// Why the watcher stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOutcome {
    /// The session left `Open` on its own; no cancellation raised.
    SessionEnded,
    /// The transport reported an error, end-of-stream, or a failed ping.
    LinkAborted,
    /// Nothing arrived for `idle_timeout`.
    IdleTimeout,
}

/// Detects a dead transport and cancels the receive loop.
///
/// Waits on session state, link status, the ping tick and the idle deadline
/// at once, so detection latency is bounded by `idle_timeout` with no
/// polling. The idle deadline is suspended while the reader is held on a
/// full queue; keep-alive pings still go out. Owns the writer half for keep-alive pings and hands it back when
/// done.
pub struct LivenessWatcher<W> {
    writer: W,
    link: watch::Receiver<LinkStatus>,
    session: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    config: LivenessConfig,
}

impl<W: FrameWriter> LivenessWatcher<W> {
    pub fn new(
        writer: W,
        link: watch::Receiver<LinkStatus>,
        session: watch::Receiver<SessionState>,
        cancel: CancellationToken,
        config: LivenessConfig,
    ) -> Self {
        Self {
            writer,
            link,
            session,
            cancel,
            config,
        }
    }

    pub async fn run(self) -> (WatchOutcome, W) {
        let Self {
            mut writer,
            mut link,
            mut session,
            cancel,
            config,
        } = self;

        let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let (state, last_seen, held) = {
                let status = link.borrow_and_update();
                (status.state, status.last_seen, status.held)
            };
            if state == LinkState::Aborted {
                break WatchOutcome::LinkAborted;
            }
            let deadline = last_seen + config.idle_timeout;

            tokio::select! {
                biased;
                _ = async { session.wait_for(|s| *s != SessionState::Open).await.map(|_| ()) } => {
                    break WatchOutcome::SessionEnded;
                }
                changed = link.changed() => {
                    if changed.is_err() {
                        break WatchOutcome::LinkAborted;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = writer.ping().await {
                        debug!(error = %e, "keep-alive ping failed");
                        break WatchOutcome::LinkAborted;
                    }
                }
                // A held reader is waiting on storage, not on the peer.
                () = sleep_until(deadline), if !held => {
                    let status = *link.borrow();
                    if !status.held && status.last_seen + config.idle_timeout <= Instant::now() {
                        break WatchOutcome::IdleTimeout;
                    }
                }
            }
        };

        if outcome != WatchOutcome::SessionEnded {
            warn!(?outcome, idle_timeout_secs = config.idle_timeout.as_secs(), "transport lost, cancelling session");
            cancel.cancel();
        }
        (outcome, writer)
    }
}
