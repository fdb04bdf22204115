// SPDX-License-Identifier: Apache-2.0

//! End to end tests: files on disk through the whole agent to an in-process
//! collector speaking the frame protocol over plain TCP.

use flate2::read::ZlibDecoder;
use log_courier::agent::{Agent, Reloader};
use log_courier::codecs::CodecRegistry;
use log_courier::config::Config;
use log_courier::registrar::{StateFile, StateMap};
use serde_json::json;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Fields = HashMap<String, String>;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), log_courier::agent::BoxError>>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(20), self.task)
            .await
            .expect("agent did not shut down")
            .unwrap()
            .unwrap();
    }
}

fn start_agent(dir: &Path, collector: SocketAddr, spool_size: usize) -> Running {
    let config = json!({
        "general": {
            "persist dir": dir,
            "spool size": spool_size,
            "spool timeout": "100ms",
            "prospect interval": "100ms",
            "host": "test-host",
        },
        "network": {
            "transport": "tcp",
            "servers": [collector.to_string()],
            "timeout": 5,
            "reconnect": "100ms",
        },
        "files": [{"paths": [dir.join("*.log")], "codecs": [{"name": "plain"}]}],
    });
    let registry = CodecRegistry::builtin();
    let config = Config::from_json_str(&config.to_string(), &registry).unwrap();

    let agent = Agent::new(Reloader::new(config, None, registry)).with_from_beginning(true);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent.run(cancel.clone()));
    Running { cancel, task }
}

async fn read_u32(socket: &mut TcpStream) -> u32 {
    socket.read_u32().await.unwrap()
}

/// Reads one `1W` + `1C` pair and decodes the `2D` frames inside.
async fn read_payload(socket: &mut TcpStream) -> (u32, Vec<(u32, Fields)>) {
    let mut tag = [0u8; 2];
    socket.read_exact(&mut tag).await.unwrap();
    assert_eq!(b"1W", &tag);
    let window = read_u32(socket).await;

    socket.read_exact(&mut tag).await.unwrap();
    assert_eq!(b"1C", &tag);
    let len = read_u32(socket).await as usize;
    let mut compressed = vec![0u8; len];
    socket.read_exact(&mut compressed).await.unwrap();

    let mut data = Vec::new();
    ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut data)
        .unwrap();
    (window, decode_data_frames(&data))
}

fn decode_data_frames(data: &[u8]) -> Vec<(u32, Fields)> {
    fn take_u32(data: &[u8], pos: &mut usize) -> u32 {
        let value = u32::from_be_bytes(data[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        value
    }
    fn take_str(data: &[u8], pos: &mut usize) -> String {
        let len = take_u32(data, pos) as usize;
        let value = String::from_utf8(data[*pos..*pos + len].to_vec()).unwrap();
        *pos += len;
        value
    }

    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        assert_eq!(b"2D", &data[pos..pos + 2]);
        pos += 2;
        let sequence = take_u32(data, &mut pos);
        let pairs = take_u32(data, &mut pos);
        let mut fields = Fields::new();
        for _ in 0..pairs {
            let key = take_str(data, &mut pos);
            let value = take_str(data, &mut pos);
            fields.insert(key, value);
        }
        frames.push((sequence, fields));
    }
    frames
}

async fn ack(socket: &mut TcpStream, sequence: u32) {
    socket.write_all(b"1A").await.unwrap();
    socket.write_u32(sequence).await.unwrap();
}

async fn wait_for_offset(dir: &Path, file: &Path, offset: i64) {
    let state_file = StateFile::new(dir);
    let source = file.to_string_lossy().into_owned();
    let reached = |states: &StateMap| states.get(&source).is_some_and(|s| s.offset() == offset);
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(Some(states)) = state_file.load() {
                if reached(&states) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("offset {} was never persisted", offset));
}

#[tokio::test]
async fn plain_tail_is_shipped_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("x.log");
    std::fs::write(&log, "a\nb\n").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(dir.path(), listener.local_addr().unwrap(), 2);

    let (mut socket, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (window, frames) = timeout(TEST_TIMEOUT, read_payload(&mut socket))
        .await
        .unwrap();
    assert_eq!(2, window);
    assert_eq!(2, frames.len());

    let (sequence, first) = &frames[0];
    assert_eq!(1, *sequence);
    assert_eq!("a", first["line"]);
    assert_eq!("0", first["offset"]);
    assert_eq!(log.to_string_lossy().as_ref(), first["file"].as_str());
    assert_eq!("test-host", first["host"]);

    let (sequence, second) = &frames[1];
    assert_eq!(2, *sequence);
    assert_eq!("b", second["line"]);
    assert_eq!("2", second["offset"]);

    ack(&mut socket, 2).await;
    wait_for_offset(dir.path(), &log, 4).await;

    agent.stop().await;
}

#[tokio::test]
async fn partial_ack_resends_the_remainder_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("x.log");
    let lines: String = (0..10).map(|i| format!("line{}\n", i)).collect();
    std::fs::write(&log, &lines).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent = start_agent(dir.path(), listener.local_addr().unwrap(), 10);

    let (mut socket, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (window, frames) = timeout(TEST_TIMEOUT, read_payload(&mut socket))
        .await
        .unwrap();
    assert_eq!(10, window);
    let sequences: Vec<u32> = frames.iter().map(|(s, _)| *s).collect();
    assert_eq!((1..=10).collect::<Vec<u32>>(), sequences);

    // Four events processed, then the collector goes away.
    ack(&mut socket, 4).await;
    wait_for_offset(dir.path(), &log, 24).await;
    drop(socket);

    let (mut socket, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (window, frames) = timeout(TEST_TIMEOUT, read_payload(&mut socket))
        .await
        .unwrap();
    assert_eq!(6, window);
    let sequences: Vec<u32> = frames.iter().map(|(s, _)| *s).collect();
    assert_eq!((5..=10).collect::<Vec<u32>>(), sequences);
    assert_eq!("line4", frames[0].1["line"]);
    assert_eq!("24", frames[0].1["offset"]);

    ack(&mut socket, 10).await;
    wait_for_offset(dir.path(), &log, 60).await;

    agent.stop().await;
}
