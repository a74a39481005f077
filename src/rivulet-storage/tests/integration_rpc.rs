//! Integration tests against an in-process storage service.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use rivulet_core::block::Block;
use rivulet_core::{DataType, Time};
use rivulet_storage::codec::ServerCodec;
use rivulet_storage::{
    Frame, ReadRequest, ReadResponse, ReadSpec, RpcStorageReader, StorageReader, Tag,
};

/// Serve one connection: capture the request, stream the responses, close.
async fn spawn_server(
    responses: Vec<ReadResponse>,
) -> (String, oneshot::Receiver<ReadRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (req_tx, req_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, ServerCodec::new());
        let request = framed.next().await.unwrap().unwrap();
        let _ = req_tx.send(request);
        for response in responses {
            framed.send(response).await.unwrap();
        }
    });

    (addr, req_rx)
}

fn series(tags: &[(&str, &str)]) -> Frame {
    Frame::Series {
        tags: tags
            .iter()
            .map(|(k, v)| Tag {
                key: (*k).to_string(),
                value: (*v).to_string(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn read_streams_blocks_in_order() {
    let responses = vec![
        ReadResponse {
            frames: vec![
                series(&[("host", "a")]),
                Frame::FloatPoints {
                    timestamps: vec![1, 2],
                    values: vec![1.0, 2.0],
                },
            ],
        },
        ReadResponse {
            frames: vec![
                Frame::FloatPoints {
                    timestamps: vec![3],
                    values: vec![3.0],
                },
                series(&[("host", "b")]),
                Frame::IntegerPoints {
                    timestamps: vec![4],
                    values: vec![40],
                },
            ],
        },
    ];
    let (addr, req_rx) = spawn_server(responses).await;

    let reader = RpcStorageReader::new(addr);
    let mut iter = reader
        .read(
            ReadSpec {
                database: "mydb".to_string(),
                predicate: None,
                limit: Some(1),
                descending: true,
            },
            Time(0),
            Time(100),
        )
        .await
        .unwrap();

    let request = req_rx.await.unwrap();
    assert_eq!(request.database, "mydb");
    assert_eq!(request.limit, Some(1));
    assert!(request.descending);
    assert_eq!(request.timestamp_range.start, 0);
    assert_eq!(request.timestamp_range.end, 100);

    // First block: two float frames, host=a.
    let block = iter.next_block().await.unwrap().unwrap();
    assert_eq!(block.tags().get("host").map(String::as_str), Some("a"));
    assert_eq!(block.cols()[1].data_type, DataType::Float);
    assert_eq!(block.cols()[2].label, "host");
    assert!(block.cols()[2].is_common);

    let mut rows: Vec<(Time, f64, String)> = Vec::new();
    {
        let mut values = block.values();
        values
            .do_float(&mut |vs, rr| {
                for (i, v) in vs.iter().enumerate() {
                    rows.push((rr.at_time(i, 0), *v, rr.at_string(i, 2).to_string()));
                }
            })
            .await
            .unwrap();
    }
    assert_eq!(
        rows,
        vec![
            (Time(1), 1.0, "a".to_string()),
            (Time(2), 2.0, "a".to_string()),
            (Time(3), 3.0, "a".to_string()),
        ]
    );

    // Second block: integer points, host=b.
    let block = iter.next_block().await.unwrap().unwrap();
    assert_eq!(block.tags().get("host").map(String::as_str), Some("b"));
    assert_eq!(block.cols()[1].data_type, DataType::Int);
    let mut ints = Vec::new();
    {
        let mut values = block.values();
        values
            .do_int(&mut |vs, _| ints.extend_from_slice(vs))
            .await
            .unwrap();
    }
    assert_eq!(ints, vec![40]);

    assert!(iter.next_block().await.unwrap().is_none());
    reader.close();
}

#[tokio::test]
async fn unread_blocks_are_skipped() {
    let responses = vec![ReadResponse {
        frames: vec![
            series(&[("host", "a")]),
            Frame::FloatPoints {
                timestamps: vec![1, 2, 3],
                values: vec![1.0, 2.0, 3.0],
            },
            series(&[("host", "b")]),
            Frame::FloatPoints {
                timestamps: vec![9],
                values: vec![9.0],
            },
        ],
    }];
    let (addr, _req) = spawn_server(responses).await;

    let reader = RpcStorageReader::new(addr);
    let mut iter = reader
        .read(ReadSpec::default(), Time(0), Time(100))
        .await
        .unwrap();

    // Drop the first block without reading its values; the iterator must
    // skip its unread point frames.
    let block = iter.next_block().await.unwrap().unwrap();
    drop(block);

    let block = iter.next_block().await.unwrap().unwrap();
    assert_eq!(block.tags().get("host").map(String::as_str), Some("b"));
    let mut floats = Vec::new();
    block
        .values()
        .do_float(&mut |vs, _| floats.extend_from_slice(vs))
        .await
        .unwrap();
    assert_eq!(floats, vec![9.0]);
}

#[tokio::test]
async fn iterator_waits_for_done_before_advancing() {
    let responses = vec![ReadResponse {
        frames: vec![
            series(&[("host", "a")]),
            Frame::FloatPoints {
                timestamps: vec![1],
                values: vec![1.0],
            },
            series(&[("host", "b")]),
            Frame::FloatPoints {
                timestamps: vec![2],
                values: vec![2.0],
            },
        ],
    }];
    let (addr, _req) = spawn_server(responses).await;

    let reader = RpcStorageReader::new(addr);
    let mut iter = reader
        .read(ReadSpec::default(), Time(0), Time(100))
        .await
        .unwrap();

    let block: Arc<dyn Block> = iter.next_block().await.unwrap().unwrap();

    // While the block is live and unread, the outer iterator must not
    // advance past it.
    let waited = tokio::time::timeout(Duration::from_millis(100), iter.next_block()).await;
    assert!(waited.is_err(), "iterator advanced before done was signalled");

    // Driving the value iterator to completion signals done.
    block
        .values()
        .do_float(&mut |_, _| {})
        .await
        .unwrap();

    let next = iter.next_block().await.unwrap().unwrap();
    assert_eq!(next.tags().get("host").map(String::as_str), Some("b"));
}

#[tokio::test]
async fn transport_errors_are_not_eof() {
    use tokio::io::AsyncWriteExt;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Read and discard the request bytes, then answer with a framed
        // payload that is not valid JSON.
        let mut buf = [0u8; 1024];
        use tokio::io::AsyncReadExt;
        let _ = socket.read(&mut buf).await;
        let garbage = b"not json";
        let mut msg = (garbage.len() as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(garbage);
        socket.write_all(&msg).await.unwrap();
    });

    let reader = RpcStorageReader::new(addr);
    let mut iter = reader
        .read(ReadSpec::default(), Time(0), Time(100))
        .await
        .unwrap();
    let err = match iter.next_block().await {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(err.to_string().contains("StorageError"));
}
