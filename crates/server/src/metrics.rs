use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime counters exported in Prometheus text format.
#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    commands_total: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mark_command(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn encode_prometheus(&self) -> String {
        let mut body = String::new();
        body.push_str("# TYPE flock_connections_active gauge\n");
        body.push_str(&format!(
            "flock_connections_active {}\n",
            self.connections_active.load(Ordering::Relaxed)
        ));
        body.push_str("# TYPE flock_commands_total counter\n");
        body.push_str(&format!(
            "flock_commands_total {}\n",
            self.commands_total.load(Ordering::Relaxed)
        ));
        body.push_str("# TYPE flock_events_delivered_total counter\n");
        body.push_str(&format!(
            "flock_events_delivered_total {}\n",
            self.events_delivered.load(Ordering::Relaxed)
        ));
        body.push_str("# TYPE flock_events_dropped_total counter\n");
        body.push_str(&format!(
            "flock_events_dropped_total {}\n",
            self.events_dropped.load(Ordering::Relaxed)
        ));
        body
    }
}
