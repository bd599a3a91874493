use crate::coordinator::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Periodically expires overdue commands and detects lapsed devices until
/// `shutdown` flips to `true`.
pub async fn run_sweeper(
    coordinator: Arc<Coordinator>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting sweeper with interval_ms={}", interval_ms);

    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.sweep().await {
                    Ok((0, 0)) => {}
                    Ok((expired, offline)) => {
                        debug!("Sweep expired {} commands, {} devices went offline", expired, offline);
                    }
                    Err(e) => {
                        // the next tick retries; nothing here is fatal
                        error!("Sweep failed: {}", e);
                    }
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::coordinator::Operator;
    use crate::model::{CommandState, Device};
    use crate::publish::BroadcastPublisher;
    use crate::store::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BroadcastPublisher::new(16)),
            clock.clone(),
            &Config::default(),
        ));
        coordinator
            .register_device(Device::new("dev-1", "org-1", "key-1"))
            .await
            .unwrap();
        let operator = Operator::new("org-1");
        let id = coordinator
            .queue_command(&operator, "dev-1", "reboot".into(), chrono::Duration::seconds(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(coordinator.clone(), 10, rx));

        let mut state = CommandState::Pending;
        for _ in 0..100 {
            state = coordinator.get_command(&operator, "dev-1", id).await.unwrap().state;
            if state == CommandState::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, CommandState::Expired);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
