use flock_proto::RelayMessage;
use tokio::sync::mpsc;

pub const PORT_BUFFER: usize = 32;

/// Page-side endpoint of a relay port. Outbound messages are tagged with the
/// page id so the background side can tell page instances apart on a shared
/// inbound channel.
pub struct PagePort {
    page_id: String,
    outbound: mpsc::Sender<(String, RelayMessage)>,
    control: mpsc::Receiver<RelayMessage>,
}

impl PagePort {
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Forwards a message to the background side. False means the channel is
    /// torn down.
    pub async fn send(&self, message: RelayMessage) -> bool {
        self.outbound
            .send((self.page_id.clone(), message))
            .await
            .is_ok()
    }

    /// Waits for the next control message from the background side.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.control.recv().await
    }
}

/// Background-side handle to one connected page.
pub struct PageHandle {
    pub page_id: String,
    control: mpsc::Sender<RelayMessage>,
}

impl PageHandle {
    /// False means the page side has gone away.
    pub async fn send(&self, message: RelayMessage) -> bool {
        self.control.send(message).await.is_ok()
    }
}

/// Opens the bidirectional port for one page instance. All coordination
/// between the stages crosses these two channels; no state is shared.
pub fn open_port(
    page_id: &str,
    inbound: mpsc::Sender<(String, RelayMessage)>,
) -> (PagePort, PageHandle) {
    let (control_tx, control_rx) = mpsc::channel(PORT_BUFFER);
    (
        PagePort {
            page_id: page_id.to_string(),
            outbound: inbound,
            control: control_rx,
        },
        PageHandle {
            page_id: page_id.to_string(),
            control: control_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_in_both_directions() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(PORT_BUFFER);
        let (mut port, handle) = open_port("page-1", inbound_tx);

        assert!(port.send(RelayMessage::LoginStatus { logged_in: true }).await);
        let (page_id, message) = inbound_rx.recv().await.unwrap();
        assert_eq!(page_id, "page-1");
        assert_eq!(message, RelayMessage::LoginStatus { logged_in: true });

        assert!(handle.send(RelayMessage::CheckLoginStatus).await);
        assert_eq!(port.recv().await, Some(RelayMessage::CheckLoginStatus));
    }

    #[tokio::test]
    async fn torn_down_port_reports_failure() {
        let (inbound_tx, inbound_rx) = mpsc::channel(PORT_BUFFER);
        let (port, handle) = open_port("page-1", inbound_tx);
        drop(port);
        assert!(!handle.send(RelayMessage::CheckLoginStatus).await);
        drop(inbound_rx);
    }
}
