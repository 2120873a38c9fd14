use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Events driving the watch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Periodic version poll
  Tick,
  /// A line typed on the console
  Input(String),
  /// A worker generation finished activating
  Activated(String),
  /// Ctrl-C or end of input
  Shutdown,
}

/// Produces events from a poll timer, stdin and worker activations.
///
/// Every producer task is aborted when the handler is dropped.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  tasks: Vec<JoinHandle<()>>,
}

impl EventHandler {
  pub fn new(poll_interval: Duration, mut activations: broadcast::Receiver<String>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::new();

    // Poll timer
    let tick_tx = tx.clone();
    tasks.push(tokio::spawn(async move {
      let mut interval = tokio::time::interval(poll_interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick fires immediately; startup runs its own check
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    }));

    // Console input
    let input_tx = tx.clone();
    tasks.push(tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if input_tx.send(Event::Input(line)).is_err() {
              break;
            }
          }
          Ok(None) | Err(_) => {
            let _ = input_tx.send(Event::Shutdown);
            break;
          }
        }
      }
    }));

    // Worker activations
    let activation_tx = tx.clone();
    tasks.push(tokio::spawn(async move {
      loop {
        match activations.recv().await {
          Ok(tag) => {
            if activation_tx.send(Event::Activated(tag)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(n)) => {
            debug!(skipped = n, "activation events lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    }));

    // Ctrl-C
    tasks.push(tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    }));

    Self { rx, tasks }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}
