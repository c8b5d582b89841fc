//! Decides which sync lifecycle events become user-visible notifications.

use chrono::{Local, NaiveTime};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::sync::SyncEvent;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NotificationPrefs {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Nothing is shown inside this window
  #[serde(default)]
  pub quiet_hours: Option<QuietHours>,
  /// Show sync summaries
  #[serde(default = "default_true")]
  pub sync_events: bool,
  /// Show aborted passes
  #[serde(default = "default_true")]
  pub errors: bool,
}

impl Default for NotificationPrefs {
  fn default() -> Self {
    Self {
      enabled: true,
      quiet_hours: None,
      sync_events: true,
      errors: true,
    }
  }
}

fn default_true() -> bool {
  true
}

/// Daily window, `"HH:MM"` on both ends. May wrap past midnight.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
  #[serde(deserialize_with = "deserialize_hhmm")]
  pub start: NaiveTime,
  #[serde(deserialize_with = "deserialize_hhmm")]
  pub end: NaiveTime,
}

impl QuietHours {
  pub fn contains(&self, time: NaiveTime) -> bool {
    if self.start <= self.end {
      time >= self.start && time < self.end
    } else {
      time >= self.start || time < self.end
    }
  }
}

fn deserialize_hhmm<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: &'static str,
  pub body: String,
}

/// Summary line shown after a pass, e.g. "Synced 4 items, 1 failed".
pub fn summary_message(synced: usize, failed: usize) -> String {
  let noun = if synced == 1 { "item" } else { "items" };
  if failed > 0 {
    format!("Synced {} {}, {} failed", synced, noun, failed)
  } else {
    format!("Synced {} {}", synced, noun)
  }
}

impl NotificationPrefs {
  pub fn decide(&self, event: &SyncEvent, now: NaiveTime) -> Option<Notification> {
    if !self.enabled || self.quiet_hours.is_some_and(|q| q.contains(now)) {
      return None;
    }

    match event {
      SyncEvent::Completed(summary) if self.sync_events && summary.synced() > 0 => {
        Some(Notification {
          title: "Sync complete",
          body: summary_message(summary.synced(), summary.failed()),
        })
      }
      SyncEvent::Failed { error } if self.errors => Some(Notification {
        title: "Sync failed",
        body: format!("Sync failed: {}", error),
      }),
      _ => None,
    }
  }
}

/// Surface accepted notifications for every sync event until the stream closes.
pub async fn run_notifier(prefs: NotificationPrefs, mut events: broadcast::Receiver<SyncEvent>) {
  loop {
    match events.recv().await {
      Ok(event) => match prefs.decide(&event, Local::now().time()) {
        Some(n) => info!(title = n.title, "{}", n.body),
        None => debug!(?event, "Notification suppressed"),
      },
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        debug!(skipped, "Notifier fell behind");
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}
