use std::collections::VecDeque;
use chrono::Local;
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Serialize, Clone, Debug)]
pub struct LogEntry {
    pub message: String,
    pub level: String,
    pub timestamp: String,
}

/// Begrenzter Ring der System-Ereignisse (Task gestartet, Step fertig,
/// Abruf angenommen, ...). Wird über die API ausgeliefert.
pub struct EventLog {
    pub entries: RwLock<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(200)),
            max_entries: 200,
        }
    }

    pub async fn push(&self, message: impl Into<String>, level: &str) {
        let mut entries = self.entries.write().await;
        entries.push_back(LogEntry {
            message: message.into(),
            level: level.to_string(),
            timestamp: Local::now().format("%H:%M:%S").to_string(),
        });
        if entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_is_bounded() {
        let log = EventLog::new();
        for i in 0..250 {
            log.push(format!("Ereignis {}", i), "info").await;
        }
        let entries = log.snapshot().await;
        assert_eq!(entries.len(), 200);
        assert_eq!(entries.last().unwrap().message, "Ereignis 249");
    }
}
