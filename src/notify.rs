use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Signal;

const CHANNEL_CAPACITY: usize = 256;

/// Tenant-wide channel carrying every signal.
pub const APPOINTMENTS_CHANNEL: &str = "appointments";

/// Per-staff channel name. LISTEN lowercases identifiers, so the ULID is
/// lowercased too.
pub fn staff_channel(staff_id: Ulid) -> String {
    format!("staff_{}", staff_id.to_string().to_ascii_lowercase())
}

/// Broadcast hub for LISTEN/NOTIFY, one per tenant.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Signal>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel by name. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Signal> {
        let sender = self
            .channels
            .entry(channel.to_ascii_lowercase())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan a signal out to the tenant channel and to each involved staff
    /// member's channel. No-op for channels nobody listens on.
    pub fn send(&self, signal: &Signal) {
        self.send_to(APPOINTMENTS_CHANNEL, signal);
        for staff_id in signal.staff_ids() {
            self.send_to(&staff_channel(*staff_id), signal);
        }
    }

    fn send_to(&self, channel: &str, signal: &Signal) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(signal.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(staff: Ulid) -> Signal {
        Signal::AppointmentCancelled {
            appointment_id: Ulid::new(),
            client_id: Ulid::new(),
            staff_ids: vec![staff],
            reason: "client asked".into(),
        }
    }

    #[tokio::test]
    async fn tenant_and_staff_channels_both_receive() {
        let hub = NotifyHub::new();
        let staff = Ulid::new();
        let mut all = hub.subscribe(APPOINTMENTS_CHANNEL);
        let mut mine = hub.subscribe(&staff_channel(staff));

        let signal = cancelled(staff);
        hub.send(&signal);

        assert_eq!(all.recv().await.unwrap(), signal);
        assert_eq!(mine.recv().await.unwrap(), signal);
    }

    #[tokio::test]
    async fn other_staff_channel_stays_quiet() {
        let hub = NotifyHub::new();
        let mut other = hub.subscribe(&staff_channel(Ulid::new()));
        hub.send(&cancelled(Ulid::new()));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn subscribe_is_case_insensitive() {
        let hub = NotifyHub::new();
        let staff = Ulid::new();
        let upper = format!("STAFF_{staff}");
        let mut rx = hub.subscribe(&upper);
        let signal = cancelled(staff);
        hub.send(&signal);
        let received = tokio_test::block_on(rx.recv());
        tokio_test::assert_ok!(&received);
        assert_eq!(received.unwrap(), signal);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        NotifyHub::new().send(&cancelled(Ulid::new()));
    }
}
