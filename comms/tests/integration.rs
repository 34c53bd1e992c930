use std::{net::TcpListener, thread, time::Duration};

use comms::{
    Collective, CollectiveExt, CommsErr, TcpComm, TcpConfig,
    msg::{Command, Msg},
};
use tokio::io;

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let msgs = [
        Msg::Control(Command::Ready { size: 4 }),
        Msg::Blob(b"Hello, world!".to_vec()),
        Msg::Values(vec![0.5, -1.0, 3.25]),
        Msg::Err("boom".into()),
    ];

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let sent = msgs.clone();
    let writer = tokio::spawn(async move {
        for msg in &sent {
            tx.send(msg).await.unwrap();
        }
    });

    for expected in &msgs {
        assert_eq!(&rx.recv().await.unwrap(), expected);
    }

    writer.await.unwrap();
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
    use tokio::io::AsyncWriteExt;

    let (mut one, two) = io::duplex(64);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    one.write_all(&u64::MAX.to_be_bytes()).await.unwrap();

    let err = rx.recv().await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn config(rank: usize, size: usize, addr: &str) -> TcpConfig {
    TcpConfig {
        rank,
        size,
        addr: addr.to_string(),
        node: format!("host-{}", rank / 2),
        connect_timeout: Duration::from_secs(10),
    }
}

#[test]
fn tcp_group_runs_collectives() {
    const SIZE: usize = 3;
    let addr = free_addr();

    let handles: Vec<_> = (0..SIZE)
        .map(|rank| {
            let config = config(rank, SIZE, &addr);
            thread::spawn(move || {
                let mut comm = TcpComm::connect(config).unwrap();
                assert_eq!(comm.rank(), rank);
                assert_eq!(comm.size(), SIZE);

                comm.barrier().unwrap();

                let mut values = [rank as f64, 1.0];
                comm.all_reduce_sum(&mut values).unwrap();

                let own = format!("rank-{rank}");
                let root: String = comm.broadcast(Some(&own), 1).unwrap();
                let everyone: Vec<usize> = comm.all_gather(&rank).unwrap();
                let split = comm.split_by_shared_memory().unwrap();

                comm.finalize().unwrap();
                assert!(matches!(comm.barrier(), Err(CommsErr::Finalized)));

                (values, root, everyone, split.local_rank, split.local_size)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for (rank, (values, root, everyone, local_rank, local_size)) in results.into_iter().enumerate() {
        assert_eq!(values, [3.0, 3.0]);
        assert_eq!(root, "rank-1");
        assert_eq!(everyone, [0, 1, 2]);
        assert_eq!(local_rank, rank % 2);
        assert_eq!(local_size, if rank < 2 { 2 } else { 1 });
    }
}

#[test]
fn a_missing_hub_times_out() {
    let mut config = config(1, 2, &free_addr());
    config.connect_timeout = Duration::from_millis(300);

    let err = TcpComm::connect(config).err().unwrap();
    assert!(matches!(err, CommsErr::Rendezvous(_)));
}
