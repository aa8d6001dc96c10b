//! The transport seam: Chum speaks text and binary frames over anything
//! that can carry them. The real transport (WebSocket, pairing, discovery)
//! is an external collaborator; tests run over an in-memory pair.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use one_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A bidirectional frame pipe between two peers.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    /// Blocks for the next frame; [`Error::PeerClosed`] when the peer went
    /// away.
    async fn recv(&mut self) -> Result<Frame>;
    fn connected(&self) -> bool;
    fn close(&mut self);
}

/// In-memory duplex connection.
pub struct MemConnection {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    open: Arc<AtomicBool>,
}

/// Returns the two ends of an in-memory connection.
pub fn memory_pair() -> (MemConnection, MemConnection) {
    let (tx_a, rx_b) = mpsc::unbounded();
    let (tx_b, rx_a) = mpsc::unbounded();
    let open = Arc::new(AtomicBool::new(true));
    (
        MemConnection {
            tx: tx_a,
            rx: rx_a,
            open: open.clone(),
        },
        MemConnection {
            tx: tx_b,
            rx: rx_b,
            open,
        },
    )
}

#[async_trait]
impl Connection for MemConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.connected() {
            return Err(Error::PeerClosed);
        }
        self.tx.send(frame).await.map_err(|_| Error::PeerClosed)
    }

    async fn recv(&mut self) -> Result<Frame> {
        match self.rx.next().await {
            Some(frame) => Ok(frame),
            None => {
                self.open.store(false, Ordering::SeqCst);
                Err(Error::PeerClosed)
            }
        }
    }

    fn connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn frames_cross_the_pair() {
        let (mut a, mut b) = memory_pair();
        a.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Frame::Text("hi".into()));
        b.send(Frame::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Frame::Binary(vec![1, 2]));
    }

    #[async_std::test]
    async fn close_is_observed_on_both_ends() {
        let (mut a, mut b) = memory_pair();
        a.close();
        assert!(matches!(b.recv().await.unwrap_err(), Error::PeerClosed));
        assert!(!b.connected());
        assert!(matches!(
            a.send(Frame::Text("x".into())).await.unwrap_err(),
            Error::PeerClosed
        ));
    }
}
