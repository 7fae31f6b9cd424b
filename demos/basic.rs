// Copyright 2020 Joyent, Inc.

// A walkthrough of the client surface against a local memcached. Start a
// server first, e.g. `memcached -p 11211`, then:
//
//     cargo run --example basic

use std::sync::Mutex;

use slog::{info, o, Drain, Logger};

use snooker::client::{Client, ClientOptions};
use snooker::codec::Value;
use snooker::connection_pool::types::PoolOptions;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic snooker example");

    let opts = ClientOptions {
        pool: PoolOptions {
            servers: vec!["127.0.0.1:11211".to_string()],
            log: Some(log.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let client = Client::new(opts).expect("client");

    let value = Value::Text("hello from snooker".to_string());
    let stored = client.set("greeting", &value, 0).expect("set");
    info!(log, "set greeting: {}", stored);

    let fetched = client.get("greeting").expect("get");
    info!(log, "get greeting: {:?}", fetched);

    client.store_counter("visits", 0).expect("store counter");
    for _ in 0..3 {
        let count = client.incr("visits").expect("incr");
        info!(log, "visits now {:?}", count);
    }

    let values = client
        .get_multi(&["greeting", "visits", "missing"])
        .expect("get_multi");
    info!(log, "multi-get returned {} values", values.len());

    let removed = client.delete("greeting").expect("delete");
    info!(log, "delete greeting: {}", removed);

    for (server, stats) in client.stats().expect("stats") {
        info!(
            log,
            "{} is memcached {}",
            server,
            stats.get("version").cloned().unwrap_or_default()
        );
    }

    client.shut_down();
}
