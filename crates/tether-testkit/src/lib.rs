//! Helpers for wiring two channels over an in-memory duplex stream, used
//! by the integration tests.

#![forbid(unsafe_code)]

use tether_core::{Channel, ChannelBuilder};

/// Handshake two builders against each other over `tokio::io::duplex`.
///
/// Panics on handshake failure: in a test, a broken handshake is a bug,
/// not a condition to handle.
pub async fn channel_pair(a: ChannelBuilder, b: ChannelBuilder) -> (Channel, Channel) {
    let (stream_a, stream_b) = tokio::io::duplex(256 * 1024);
    let (channel_a, channel_b) = tokio::join!(a.connect(stream_a), b.connect(stream_b));
    (
        channel_a.expect("left-side handshake failed"),
        channel_b.expect("right-side handshake failed"),
    )
}

/// A plain pair with default options and no root objects.
pub async fn plain_pair() -> (Channel, Channel) {
    channel_pair(ChannelBuilder::new("left"), ChannelBuilder::new("right")).await
}
