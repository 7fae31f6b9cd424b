// Copyright 2020 Joyent, Inc.

//! End-to-end client scenarios against an in-process fake memcached server
//! speaking the text protocol over a real TCP listener.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use snooker::client::{Client, ClientOptions};
use snooker::codec::{Value, F_COMPRESSED, F_SERIALIZED};
use snooker::connection_pool::types::PoolOptions;
use snooker::error::Error;

type Entry = (u32, Vec<u8>);
type Store = Arc<Mutex<HashMap<String, Entry>>>;
type SeenKeys = Arc<Mutex<Vec<String>>>;

// Just enough of a memcached to exercise every command family the client
// issues: set/add/replace, get (multi-key), delete, incr/decr, stats, and
// flush_all.
struct FakeServer {
    addr: String,
    store: Store,
    seen: SeenKeys,
}

impl FakeServer {
    fn start() -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let seen: SeenKeys = Arc::new(Mutex::new(Vec::new()));

        let accept_store = Arc::clone(&store);
        let accept_seen = Arc::clone(&seen);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let store = Arc::clone(&accept_store);
                        let seen = Arc::clone(&accept_seen);
                        thread::spawn(move || {
                            serve_client(stream, store, seen)
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        FakeServer { addr, store, seen }
    }

    // Raw flags and payload as stored, bypassing the client codec.
    fn peek(&self, key: &str) -> Option<Entry> {
        self.store.lock().unwrap().get(key).cloned()
    }

    fn saw_key(&self, key: &str) -> bool {
        self.seen.lock().unwrap().iter().any(|seen_key| seen_key == key)
    }
}

fn serve_client(stream: TcpStream, store: Store, seen: SeenKeys) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        let line = String::from_utf8(line).unwrap();
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let reply: Vec<u8> = match parts[0] {
            "set" | "add" | "replace" => {
                let key = parts[1].to_string();
                let flags: u32 = parts[2].parse().unwrap();
                let _expiry: i64 = parts[3].parse().unwrap();
                let len: usize = parts[4].parse().unwrap();
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).unwrap();
                let mut eol = Vec::new();
                reader.read_until(b'\n', &mut eol).unwrap();

                seen.lock().unwrap().push(key.clone());
                let mut map = store.lock().unwrap();
                let exists = map.contains_key(&key);
                let store_it = match parts[0] {
                    "set" => true,
                    "add" => !exists,
                    _ => exists,
                };
                if store_it {
                    map.insert(key, (flags, payload));
                    b"STORED\r\n".to_vec()
                } else {
                    b"NOT_STORED\r\n".to_vec()
                }
            }
            "get" => {
                let map = store.lock().unwrap();
                let mut reply = Vec::new();
                for key in &parts[1..] {
                    seen.lock().unwrap().push(key.to_string());
                    if let Some((flags, data)) = map.get(*key) {
                        reply.extend_from_slice(
                            format!(
                                "VALUE {} {} {}\r\n",
                                key,
                                flags,
                                data.len()
                            )
                            .as_bytes(),
                        );
                        reply.extend_from_slice(data);
                        reply.extend_from_slice(b"\r\n");
                    }
                }
                reply.extend_from_slice(b"END\r\n");
                reply
            }
            "delete" => {
                if store.lock().unwrap().remove(parts[1]).is_some() {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            "incr" | "decr" => {
                let quantity: u64 = parts[2].parse().unwrap();
                let mut map = store.lock().unwrap();
                match map.get_mut(parts[1]) {
                    None => b"NOT_FOUND\r\n".to_vec(),
                    Some((_flags, data)) => {
                        let current: u64 = String::from_utf8(data.clone())
                            .unwrap()
                            .parse()
                            .unwrap();
                        let next = if parts[0] == "incr" {
                            current.wrapping_add(quantity)
                        } else {
                            current.saturating_sub(quantity)
                        };
                        *data = next.to_string().into_bytes();
                        format!("{}\r\n", next).into_bytes()
                    }
                }
            }
            "stats" => {
                b"STAT version 1.6.21\r\nSTAT threads 4\r\nEND\r\n".to_vec()
            }
            "flush_all" => {
                store.lock().unwrap().clear();
                b"OK\r\n".to_vec()
            }
            _ => b"ERROR\r\n".to_vec(),
        };

        if writer.write_all(&reply).is_err() || writer.flush().is_err() {
            return;
        }
    }
}

// An address that refuses connections: bind an ephemeral port, then free
// it.
fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn client_options(servers: &[&str]) -> ClientOptions {
    ClientOptions {
        pool: PoolOptions {
            servers: servers.iter().map(|s| s.to_string()).collect(),
            maint_sleep_ms: Some(0),
            socket_timeout_ms: Some(2000),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn set_then_get_round_trips_across_two_servers() {
    let server0 = FakeServer::start();
    let server1 = FakeServer::start();
    let client =
        Client::new(client_options(&[&server0.addr, &server1.addr])).unwrap();

    // Under the default hash, "a" and "c" select bucket 1 and "b" selects
    // bucket 0.
    for key in &["a", "b", "c"] {
        let value = Value::Text(format!("value-{}", key));
        assert!(client.set(key, &value, 0).unwrap());
        assert_eq!(client.get(key).unwrap(), Some(value));
    }

    assert!(server1.saw_key("a"));
    assert!(server0.saw_key("b"));
    assert!(server1.saw_key("c"));
    assert!(!server0.saw_key("a"));
    assert!(!server1.saw_key("b"));

    client.shut_down();
}

#[test]
fn large_value_is_compressed_on_the_wire() {
    let server = FakeServer::start();
    let mut opts = client_options(&[&server.addr]);
    opts.compress_threshold = Some(64);
    let client = Client::new(opts).unwrap();

    let value = Value::Text("A".repeat(1024));
    assert!(client.set("k", &value, 0).unwrap());

    // The stored payload is the gzip form, marked as such.
    let (flags, stored) = server.peek("k").unwrap();
    assert_ne!(flags & F_COMPRESSED, 0);
    assert!(stored.len() < 1024);

    // And the client hands back the original 1024 bytes of 0x41.
    assert_eq!(client.get("k").unwrap(), Some(value));

    client.shut_down();
}

#[test]
fn blob_values_round_trip_with_the_serialized_flag() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    let value = Value::Blob(vec![0x00, 0xff, 0x9f, 0x92]);
    assert!(client.set("blob", &value, 0).unwrap());
    let (flags, _stored) = server.peek("blob").unwrap();
    assert_ne!(flags & F_SERIALIZED, 0);
    assert_eq!(client.get("blob").unwrap(), Some(value));

    client.shut_down();
}

#[test]
fn counters_mutate_and_clamp() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    assert!(client.store_counter("c", 100).unwrap());
    assert_eq!(client.incr("c").unwrap(), Some(101));
    assert_eq!(client.incr_by("c", 5).unwrap(), Some(106));
    assert_eq!(client.decr_by("c", 4).unwrap(), Some(102));
    // Underflow clamps to zero on the server.
    assert_eq!(client.decr_by("c", 1000).unwrap(), Some(0));
    assert_eq!(client.get_counter("c").unwrap(), Some(0));

    assert_eq!(client.incr("absent").unwrap(), None);

    client.shut_down();
}

#[test]
fn delete_reports_presence() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    assert!(!client.delete("missing").unwrap());

    assert!(client.set("k", &Value::Text("v".to_string()), 0).unwrap());
    assert!(client.delete("k").unwrap());
    assert_eq!(client.get("k").unwrap(), None);

    client.shut_down();
}

#[test]
fn add_and_replace_respect_presence() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    let value = Value::Text("v".to_string());
    assert!(!client.replace("k", &value, 0).unwrap());
    assert!(client.add("k", &value, 0).unwrap());
    assert!(!client.add("k", &value, 0).unwrap());
    assert!(client.replace("k", &value, 0).unwrap());

    client.shut_down();
}

#[test]
fn failover_completes_against_the_live_server() {
    let dead = refused_addr();
    let live = FakeServer::start();

    // "b" selects bucket 0, the dead server; the rehash walk must finish
    // on the live one.
    let client = Client::new(client_options(&[&dead, &live.addr])).unwrap();
    let value = Value::Text("survived".to_string());
    assert!(client.set("b", &value, 0).unwrap());
    assert_eq!(client.get("b").unwrap(), Some(value));
    assert!(live.saw_key("b"));
    client.shut_down();
}

#[test]
fn no_failover_surfaces_unreachable() {
    let dead = refused_addr();
    let live = FakeServer::start();

    let mut opts = client_options(&[&dead, &live.addr]);
    opts.pool.failover = Some(false);
    let client = Client::new(opts).unwrap();

    match client.get("b") {
        Err(Error::Unreachable(_)) => {}
        other => panic!("expected Unreachable, got {:?}", other),
    }

    // Keys owned by the live bucket still work.
    let value = Value::Text("fine".to_string());
    assert!(client.set("a", &value, 0).unwrap());
    assert_eq!(client.get("a").unwrap(), Some(value));

    client.shut_down();
}

#[test]
fn get_multi_merges_per_server_results() {
    let server0 = FakeServer::start();
    let server1 = FakeServer::start();
    let client =
        Client::new(client_options(&[&server0.addr, &server1.addr])).unwrap();

    for key in &["k1", "k2", "k3"] {
        let value = Value::Text(format!("value-{}", key));
        assert!(client.set(key, &value, 0).unwrap());
    }

    let values = client.get_multi(&["k1", "k2", "k3"]).unwrap();
    assert_eq!(values.len(), 3);
    for key in &["k1", "k2", "k3"] {
        assert_eq!(
            values[*key],
            Value::Text(format!("value-{}", key))
        );
    }

    // The array variant preserves caller order, including misses.
    let array = client
        .get_multi_array(&["k3", "missing", "k1"])
        .unwrap();
    assert_eq!(array.len(), 3);
    assert_eq!(array[0], Some(Value::Text("value-k3".to_string())));
    assert_eq!(array[1], None);
    assert_eq!(array[2], Some(Value::Text("value-k1".to_string())));

    client.shut_down();
}

#[test]
fn get_multi_omits_keys_on_down_servers() {
    let live = FakeServer::start();
    let dead = refused_addr();

    // Bucket 0 is live, bucket 1 is dead. "k1" and "k3" select bucket 0,
    // "k2" selects bucket 1.
    let mut opts = client_options(&[&live.addr, &dead]);
    opts.pool.failover = Some(false);
    let client = Client::new(opts).unwrap();

    for key in &["k1", "k3"] {
        let value = Value::Text(format!("value-{}", key));
        assert!(client.set(key, &value, 0).unwrap());
    }

    let values = client.get_multi(&["k1", "k2", "k3"]).unwrap();
    assert_eq!(values.len(), 2);
    assert!(values.contains_key("k1"));
    assert!(values.contains_key("k3"));
    assert!(!values.contains_key("k2"));

    client.shut_down();
}

#[test]
fn stats_reports_every_reachable_server() {
    let server0 = FakeServer::start();
    let server1 = FakeServer::start();
    let client =
        Client::new(client_options(&[&server0.addr, &server1.addr])).unwrap();

    let all = client.stats().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&server0.addr]["version"], "1.6.21");
    assert_eq!(all[&server1.addr]["threads"], "4");

    client.shut_down();
}

#[test]
fn flush_all_clears_every_server() {
    let server0 = FakeServer::start();
    let server1 = FakeServer::start();
    let client =
        Client::new(client_options(&[&server0.addr, &server1.addr])).unwrap();

    // "a" lands on server1 and "b" on server0, so the sweep must reach
    // both.
    assert!(client.set("a", &Value::Text("1".to_string()), 0).unwrap());
    assert!(client.set("b", &Value::Text("2".to_string()), 0).unwrap());

    client.flush_all().unwrap();
    assert_eq!(client.get("a").unwrap(), None);
    assert_eq!(client.get("b").unwrap(), None);

    client.shut_down();
}

#[test]
fn repeated_set_is_idempotent() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    let value = Value::Text("same".to_string());
    for _ in 0..5 {
        assert!(client.set("k", &value, 0).unwrap());
    }
    assert_eq!(client.get("k").unwrap(), Some(value));

    client.shut_down();
}

#[test]
fn concurrent_operations_share_the_pool() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();

    let mut threads = Vec::new();
    for worker in 0..4 {
        let client = client.clone();
        threads.push(thread::spawn(move || {
            for i in 0..20 {
                let key = format!("w{}-{}", worker, i);
                let value = Value::Text(format!("{}", i));
                assert!(client.set(&key, &value, 0).unwrap());
                assert_eq!(client.get(&key).unwrap(), Some(value));
            }
        }));
    }
    for handle in threads {
        handle.join().unwrap();
    }

    let stats = client.pool_stats();
    assert_eq!(stats.busy_connections, 0.into());

    client.shut_down();
}

#[test]
fn process_wide_instance_is_a_convenience() {
    let server = FakeServer::start();
    let client = Client::new(client_options(&[&server.addr])).unwrap();
    Client::set_instance(client);

    let instance = Client::instance().expect("instance was installed");
    assert!(instance
        .set("global", &Value::Text("yes".to_string()), 0)
        .unwrap());
    assert_eq!(
        instance.get("global").unwrap(),
        Some(Value::Text("yes".to_string()))
    );

    instance.shut_down();
}
