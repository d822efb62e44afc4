#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate bytes;
extern crate libredmux;
extern crate tokio_util;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use libredmux::protocol::redis::{parse_cluster_nodes, RespCodec};
use libredmux::topology::InfoFields;

fuzz_target!(|data: &[u8]| {
    let mut src = BytesMut::from(data);
    let mut codec = RespCodec::new();
    loop {
        match codec.decode(&mut src) {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_err) => break,
        }
    }
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_cluster_nodes(text, "127.0.0.1:7000");
        let _ = InfoFields::parse(text).replica_endpoints();
    }
});
