//! Transport conformance: the same RPC traffic must behave identically
//! over the pull-style stream transport and the push-style buffered
//! transport, including hostile byte slicing on the buffered path.

use std::sync::Arc;

use tether_core::{
    BufferedTransport, Capability, Channel, ChannelBuilder, ChannelOptions, DispatchTable,
    ReturnValue, StreamTransport,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_root() -> DispatchTable {
    DispatchTable::new("Echo")
        .method("echo", |_cx, args| async move {
            let payload: Vec<u8> = args.value(0)?;
            ReturnValue::of(&payload)
        })
        .method("add", |_cx, args| async move {
            let a: i32 = args.value(0)?;
            let b: i32 = args.value(1)?;
            ReturnValue::of(&(a + b))
        })
}

/// Two channels over a handshaken in-memory stream pair.
async fn stream_pair() -> (Channel, Channel) {
    let opts = ChannelOptions::default();
    let (ta, tb) = StreamTransport::pair(&opts, &opts).await.expect("handshake");
    let a = ChannelBuilder::new("stream-a").root(echo_root()).over(Arc::new(ta));
    let b = ChannelBuilder::new("stream-b").root(echo_root()).over(Arc::new(tb));
    (a, b)
}

/// Two channels over buffered transports, with a byte shovel between them
/// that deliberately fragments and coalesces.
async fn buffered_pair() -> (Channel, Channel) {
    let (ta, mut out_a) = BufferedTransport::new(Capability::current(), 512);
    let (tb, mut out_b) = BufferedTransport::new(Capability::current(), 512);
    let ta = Arc::new(ta);
    let tb = Arc::new(tb);

    // a -> b: one byte at a time.
    {
        let tb = tb.clone();
        tokio::spawn(async move {
            while let Some(block) = out_a.recv().await {
                for byte in block {
                    if tb.receive(&[byte]).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
    // b -> a: uneven block sizes.
    {
        let ta = ta.clone();
        tokio::spawn(async move {
            let mut step = 1usize;
            while let Some(block) = out_b.recv().await {
                let mut rest = block.as_slice();
                while !rest.is_empty() {
                    let take = step.min(rest.len());
                    step = step % 97 + 3;
                    if ta.receive(&rest[..take]).await.is_err() {
                        return;
                    }
                    rest = &rest[take..];
                }
            }
        });
    }

    let a = ChannelBuilder::new("buffered-a").root(echo_root()).over(ta);
    let b = ChannelBuilder::new("buffered-b").root(echo_root()).over(tb);
    (a, b)
}

async fn run_round_trip(a: &Channel, b: &Channel) {
    let sum: i32 = a.root().unwrap().invoke("add").arg(&2i32).arg(&3i32).call().await.unwrap();
    assert_eq!(sum, 5);
    let sum: i32 = b.root().unwrap().invoke("add").arg(&40i32).arg(&2i32).call().await.unwrap();
    assert_eq!(sum, 42);
}

async fn run_large_payload(a: &Channel) {
    // Big enough to cross many frames in both directions.
    let blob: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
    let back: Vec<u8> =
        a.root().unwrap().invoke("echo").arg(&blob).call().await.expect("echo failed");
    assert_eq!(back, blob);
}

async fn run_sequential_calls_stay_ordered(a: &Channel) {
    for i in 0..32i32 {
        let sum: i32 =
            a.root().unwrap().invoke("add").arg(&i).arg(&1i32).call().await.unwrap();
        assert_eq!(sum, i + 1);
    }
}

async fn run_concurrent_calls(a: &Channel) {
    let mut handles = Vec::new();
    for i in 0..16i32 {
        let root = a.root().unwrap();
        handles.push(tokio::spawn(async move {
            let sum: i32 = root.invoke("add").arg(&i).arg(&i).call().await.unwrap();
            (i, sum)
        }));
    }
    for handle in handles {
        let (i, sum) = handle.await.unwrap();
        assert_eq!(sum, i * 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_round_trip() {
    init_tracing();
    let (a, b) = stream_pair().await;
    run_round_trip(&a, &b).await;
    a.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_large_payload() {
    init_tracing();
    let (a, _b) = stream_pair().await;
    run_large_payload(&a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_sequential_calls() {
    init_tracing();
    let (a, _b) = stream_pair().await;
    run_sequential_calls_stay_ordered(&a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_concurrent_calls() {
    init_tracing();
    let (a, _b) = stream_pair().await;
    run_concurrent_calls(&a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_round_trip() {
    init_tracing();
    let (a, b) = buffered_pair().await;
    run_round_trip(&a, &b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_large_payload() {
    init_tracing();
    let (a, _b) = buffered_pair().await;
    run_large_payload(&a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_concurrent_calls() {
    init_tracing();
    let (a, _b) = buffered_pair().await;
    run_concurrent_calls(&a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_mode_round_trip() {
    init_tracing();
    let opts = ChannelOptions::default().mode(tether_core::ModePreference::Text);
    let (ta, tb) = StreamTransport::pair(&opts, &opts).await.expect("handshake");
    let a = ChannelBuilder::new("text-a").root(echo_root()).over(Arc::new(ta));
    let b = ChannelBuilder::new("text-b").root(echo_root()).over(Arc::new(tb));
    run_round_trip(&a, &b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capability_negotiation_is_visible_on_the_channel() {
    init_tracing();
    let narrow = ChannelOptions::default()
        .capability(Capability::CHUNKED_FRAMING | Capability::PIPE_THROTTLING);
    let (ta, tb) = StreamTransport::pair(&ChannelOptions::default(), &narrow)
        .await
        .expect("handshake");
    let a = ChannelBuilder::new("wide").over(Arc::new(ta));
    let _b = ChannelBuilder::new("narrow").over(Arc::new(tb));
    assert!(!a.remote_capability().contains(Capability::GREEDY_PIPES));
    assert!(a.remote_capability().contains(Capability::PIPE_THROTTLING));
}
