#![no_main]

use bytes::BytesMut;
use dbspool_proxy::ServerCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Small limit so oversized length prefixes are hit often
    let mut codec = ServerCodec::with_config(&dbspool_proxy::ProxyConfig::new().max_frame_size(4096));
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
