// Outbound notification seam. The core formats text and addresses a chat;
// delivering it is the surrounding transport's problem.

use tokio::sync::mpsc;
use tracing::warn;

/// One message addressed to one chat.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub chat_id: i64,
    pub text: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, chat_id: i64, text: String);
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    fn notify(&self, chat_id: i64, text: String) {
        (**self).notify(chat_id, text);
    }
}

/// Pushes notifications into an unbounded channel for an external chat
/// transport to drain.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, chat_id: i64, text: String) {
        if self.sender.send(Notification { chat_id, text }).is_err() {
            warn!(chat_id, "Notification channel closed, message dropped");
        }
    }
}
