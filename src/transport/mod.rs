//! Moving frames between the host and the instrument.
//!
//! A [`Transport`] owns one link. It frames the incoming byte stream,
//! drops whatever does not parse, and hands valid frames up one at a time.
//! Only one request is ever outstanding; the session that owns the transport
//! holds it mutably for the duration of each exchange.

use std::time::Duration;

use async_trait::async_trait;

use crate::packet::{Frame, PacketCodec};

#[cfg(feature = "serial")]
pub mod serialport;

/// Depth of the queue between the reader and [`Transport::recv`].
pub const FRAME_CHANNEL_SIZE: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    fn codec(&self) -> &PacketCodec;

    async fn connect(&self) -> Result<(), crate::Error>;

    async fn disconnect(&self) -> Result<(), crate::Error>;

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), crate::Error>;

    /// Next valid frame, or `None` once `timeout` elapses without one.
    async fn recv(&self, timeout: Duration) -> Result<Option<Frame>, crate::Error>;

    /// Discards every frame already queued; returns how many were dropped.
    async fn flush(&self) -> Result<usize, crate::Error>;

    async fn send(&self, frame: &Frame) -> Result<(), crate::Error> {
        let bytes = self.codec().encode(frame);
        log::trace!("tx {}", hex::encode(bytes));
        self.send_raw(&bytes).await
    }

    /// Sends `frame` and waits up to `timeout` for the reply.
    async fn send_recv(&self, frame: &Frame, timeout: Duration) -> Result<Option<Frame>, crate::Error> {
        self.send(frame).await?;
        self.recv(timeout).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn codec(&self) -> &PacketCodec {
        (**self).codec()
    }

    async fn connect(&self) -> Result<(), crate::Error> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<(), crate::Error> {
        (**self).disconnect().await
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), crate::Error> {
        (**self).send_raw(bytes).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Frame>, crate::Error> {
        (**self).recv(timeout).await
    }

    async fn flush(&self) -> Result<usize, crate::Error> {
        (**self).flush().await
    }

    async fn send_recv(&self, frame: &Frame, timeout: Duration) -> Result<Option<Frame>, crate::Error> {
        (**self).send_recv(frame, timeout).await
    }
}
