use std::time::{Duration, Instant};

pub const NOTICE_TTL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct Notice {
    message: String,
    shown_at: Instant,
    ttl: Duration,
}

impl Notice {
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    pub fn is_expired(&self) -> bool {
        self.shown_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
pub struct Notifier {
    notices: Vec<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, message: impl Into<String>) {
        self.show_for(message, NOTICE_TTL);
    }

    pub fn show_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.notices.push(Notice {
            message: message.into(),
            shown_at: Instant::now(),
            ttl,
        });
    }

    /// Prunes expired notices and returns the rest, oldest first.
    pub fn active(&mut self) -> Vec<&Notice> {
        self.notices.retain(|notice| !notice.is_expired());
        self.notices.iter().collect()
    }
}

/// Best-effort clipboard target. Failure is reported via a [`Notifier`]
/// notice, never an error surfaced to the generation flow.
pub trait ClipboardSink {
    fn write(&mut self, text: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;

    #[test]
    fn fresh_notice_is_active() {
        let mut notifier = Notifier::new();
        notifier.show("Copied to clipboard");
        let active = notifier.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message(), "Copied to clipboard");
    }

    #[test]
    fn zero_ttl_notice_expires_immediately() {
        let mut notifier = Notifier::new();
        notifier.show_for("gone", Duration::ZERO);
        assert!(notifier.active().is_empty());
    }

    #[test]
    fn expired_notices_are_pruned_but_fresh_ones_remain() {
        let mut notifier = Notifier::new();
        notifier.show_for("old", Duration::ZERO);
        notifier.show("new");
        let active = notifier.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message(), "new");
    }

    #[test]
    fn clipboard_failure_maps_to_a_notice() {
        struct BrokenClipboard;
        impl ClipboardSink for BrokenClipboard {
            fn write(&mut self, _text: &str) -> anyhow::Result<()> {
                bail!("no clipboard available")
            }
        }

        let mut notifier = Notifier::new();
        let mut clipboard = BrokenClipboard;
        match clipboard.write("cat") {
            Ok(()) => notifier.show("Copied to clipboard"),
            Err(_) => notifier.show("Copy failed"),
        }
        assert_eq!(notifier.active()[0].message(), "Copy failed");
    }
}
