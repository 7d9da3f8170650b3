//! Upstream supervision: reconnect crashed children with capped exponential
//! backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::mcp::upstream::UpstreamHandle;

/// First reconnect delay
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
/// Ceiling for the reconnect delay
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Consecutive failures before the supervisor gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// Supervise one upstream until the stop signal fires.
///
/// Each child process is owned by exactly one supervisor task; a successful
/// connect resets the failure counter.
pub fn spawn_supervisor(
    handle: Arc<UpstreamHandle>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            match handle.connect().await {
                Ok(()) => {
                    failures = 0;
                    // Wait for the child to die or for shutdown.
                    tokio::select! {
                        _ = handle.wait_closed() => {
                            if *stop.borrow() {
                                break;
                            }
                            tracing::warn!(upstream = %handle.name(), "Upstream connection lost, restarting");
                            handle.mark_disconnected().await;
                        }
                        _ = stop.changed() => {
                            break;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::error!(
                            upstream = %handle.name(),
                            failures,
                            error = %e,
                            "Upstream restart budget exhausted, giving up"
                        );
                        handle.mark_disconnected().await;
                        break;
                    }

                    let delay = backoff_delay(failures);
                    tracing::warn!(
                        upstream = %handle.name(),
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream connect failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => break,
                    }
                }
            }
        }

        handle.shutdown().await;
    })
}

/// Exponential backoff: 500ms, 1s, 2s, ... capped at 30s
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = BACKOFF_INITIAL.saturating_mul(1u32 << exp);
    delay.min(BACKOFF_MAX)
}
