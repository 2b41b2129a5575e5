use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;

pub(crate) const RING_CAPACITY: usize = 500;

/// Republishes every tracing event as a JSON line for the `/api/logs` stream
/// and keeps the most recent lines for late subscribers.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<Mutex<VecDeque<String>>>,
}

/// Pulls the formatted message and the `repo` field, if any, out of an event.
#[derive(Default)]
struct LineVisitor {
    message: String,
    repo: Option<String>,
}

impl LineVisitor {
    fn slot(&mut self, name: &str) -> Option<&mut String> {
        match name {
            "message" => Some(&mut self.message),
            "repo" => Some(self.repo.get_or_insert_with(String::new)),
            _ => None,
        }
    }
}

impl tracing::field::Visit for LineVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if let Some(slot) = self.slot(field.name()) {
            *slot = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if let Some(slot) = self.slot(field.name()) {
            let text = format!("{value:?}");
            // Debug on &str adds quotes
            *slot = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
                Some(inner) => inner.to_string(),
                None => text,
            };
        }
    }
}

pub(crate) fn category(target: &str) -> &'static str {
    if target.contains("pipeline") || target.contains("ecosystem") || target.contains("workspace") {
        "pipeline"
    } else if target.contains("scheduler") || target.contains("wakeup") {
        "scheduler"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut line = LineVisitor::default();
        event.record(&mut line);

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut json = serde_json::json!({
            "ts": ts,
            "level": level,
            "message": line.message,
            "category": category(event.metadata().target()),
        });
        if let Some(repo) = line.repo {
            json["repo"] = repo.into();
        }
        let json = json.to_string();

        let _ = self.tx.send(json.clone());
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push_back(json);
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn categories_follow_target() {
        assert_eq!(category("depbot_core::pipeline"), "pipeline");
        assert_eq!(category("depbot_core::ecosystem::node"), "pipeline");
        assert_eq!(category("depbot_core::smart_scheduler"), "scheduler");
        assert_eq!(category("depbot_server"), "system");
    }

    #[test]
    fn events_land_in_ring_and_channel() {
        let (tx, mut rx) = broadcast::channel(1024);
        let ring = Arc::new(Mutex::new(VecDeque::new()));
        let subscriber = tracing_subscriber::registry().with(BroadcastLayer {
            tx,
            ring: Arc::clone(&ring),
        });

        tracing::subscriber::with_default(subscriber, || {
            for i in 0..(RING_CAPACITY + 5) {
                tracing::info!("line {i}");
            }
            tracing::warn!(target: "depbot_core::scheduler", repo = %"/srv/shop", "job failed");
        });

        let ring = ring.lock().unwrap();
        assert_eq!(ring.len(), RING_CAPACITY);
        let last: serde_json::Value = serde_json::from_str(ring.back().unwrap()).unwrap();
        assert_eq!(last["level"], "warn");
        assert_eq!(last["message"], "job failed");
        assert_eq!(last["category"], "scheduler");
        assert_eq!(last["repo"], "/srv/shop");

        let first: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["message"], "line 0");
        assert!(first.get("repo").is_none());
    }
}
