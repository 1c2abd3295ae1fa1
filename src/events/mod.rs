use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the order lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        total: Decimal,
        idempotent_replay: bool,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
        actor: String,
    },
    PreferenceCreated {
        order_id: Uuid,
        preference_id: String,
    },
    PreferenceFailed {
        order_id: Uuid,
    },
    OrderPaid {
        order_id: Uuid,
        payment_id: Option<String>,
    },
    StockDecremented {
        order_id: Uuid,
    },
    ConfirmationEmailSent {
        order_id: Uuid,
    },
    ConfirmationEmailFailed {
        order_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; failures are reported, never propagated, because
    /// event delivery is observational and must not fail the operation
    /// that produced it.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Builds a channel pair sized for bursty checkout traffic.
pub fn channel() -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(1024);
    (EventSender::new(tx), rx)
}

/// Drains the event channel, logging each event. Runs until all senders
/// are dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                total,
                idempotent_replay,
            } => {
                info!(order_id = %order_id, total = %total, idempotent_replay, "event: order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                actor,
            } => {
                info!(order_id = %order_id, %old_status, %new_status, %actor, "event: order status changed");
            }
            Event::PreferenceCreated {
                order_id,
                preference_id,
            } => {
                info!(order_id = %order_id, %preference_id, "event: payment preference created");
            }
            Event::PreferenceFailed { order_id } => {
                warn!(order_id = %order_id, "event: payment preference failed");
            }
            Event::OrderPaid {
                order_id,
                payment_id,
            } => {
                info!(order_id = %order_id, payment_id = ?payment_id, "event: order paid");
            }
            Event::StockDecremented { order_id } => {
                info!(order_id = %order_id, "event: stock decremented");
            }
            Event::ConfirmationEmailSent { order_id } => {
                info!(order_id = %order_id, "event: confirmation email sent");
            }
            Event::ConfirmationEmailFailed { order_id, reason } => {
                warn!(order_id = %order_id, %reason, "event: confirmation email failed");
            }
        }
    }
    info!("Event channel closed; processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_receiver_drop_does_not_panic() {
        let (sender, receiver) = channel();
        drop(receiver);
        sender
            .send(Event::PreferenceFailed {
                order_id: Uuid::new_v4(),
            })
            .await;
    }
}
