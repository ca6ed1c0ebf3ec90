use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dfadev::{
    automaton::{ACCEPT, REJECT},
    client,
    command::{self, Command, DFAIOCACCEPT, DFAIOCADD},
    http::{self, App, Limits},
    persist::SnapshotStore,
    upgrade::{self, InitMode},
    Device, Engine, Error,
};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::TokioIo;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{net::TcpListener, task::JoinHandle};

struct Server {
    addr: String,
    engine: Arc<Engine>,
    task: JoinHandle<()>,
}

async fn spawn_on(listener: TcpListener, engine: Arc<Engine>, limits: Limits) -> Server {
    let addr = listener.local_addr().unwrap().to_string();
    let app = Arc::new(App::new(engine.clone(), "dfa", limits));
    let task = tokio::spawn(http::serve(listener, app));
    Server { addr, engine, task }
}

async fn spawn(engine: Engine, limits: Limits) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_on(listener, Arc::new(engine), limits).await
}

async fn odd_length(dev: &mut Device) {
    dev.control(&command::odd_length()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn odd_length_under_random_io() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    odd_length(&mut dev).await;

    let mut rng = StdRng::seed_from_u64(0x0dfa);
    let mut total = 0usize;
    for k in 0..100 {
        let writelen = rng.random::<u8>() as usize;
        let readlen = rng.random::<u8>() as usize;

        let status = dev.read(readlen).await.unwrap();
        assert_eq!(status.len(), readlen);
        let expected = if total % 2 == 1 { ACCEPT } else { REJECT };
        assert!(status.iter().all(|&b| b == expected), "round {k} after {total} bytes");

        let mut data = vec![0u8; writelen];
        rng.fill(&mut data[..]);
        assert_eq!(dev.write(&data).await.unwrap(), writelen);
        total += writelen;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_never_move_the_run() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    odd_length(&mut dev).await;
    dev.write(b"abc").await.unwrap();

    for n in [1, 2, 100, 0, 5000] {
        let status = dev.read(n).await.unwrap();
        assert_eq!(status, vec![ACCEPT; n]);
    }
    assert_eq!(server.engine.checkpoint().automaton.current(), 1);
    assert!(dev.fin().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn store_is_shared_across_connections() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut first = Device::open(&server.addr).await.unwrap();
    odd_length(&mut first).await;
    first.write(b"1").await.unwrap();
    first.close();

    let mut second = Device::open(&server.addr).await.unwrap();
    let mut third = Device::open(&server.addr).await.unwrap();
    assert!(second.fin().await.unwrap());
    third.write(b"2").await.unwrap();
    assert!(!second.fin().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_arguments_are_refused() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    odd_length(&mut dev).await;
    dev.write(b"x").await.unwrap();
    let before = server.engine.checkpoint();

    assert!(matches!(dev.add(0, 0, 256).await, Err(Error::OutOfRange(256))));
    assert!(matches!(dev.add(-1, 0, 0).await, Err(Error::OutOfRange(-1))));
    assert!(matches!(dev.add(0, 1000, 0).await, Err(Error::OutOfRange(1000))));
    assert!(matches!(dev.accept(256).await, Err(Error::OutOfRange(256))));
    assert!(matches!(dev.reject(-3).await, Err(Error::OutOfRange(-3))));

    let batch = [Command::Reset, Command::Accept { p: 0 }, Command::Reject { p: 999 }];
    assert!(matches!(dev.control(&batch).await, Err(Error::OutOfRange(999))));

    assert_eq!(server.engine.checkpoint(), before);
    assert!(dev.fin().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_clears_everything() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    odd_length(&mut dev).await;
    dev.write(b"x").await.unwrap();
    dev.reset().await.unwrap();

    assert!(!dev.fin().await.unwrap());
    dev.write(b"x").await.unwrap();
    assert!(!dev.fin().await.unwrap());
    assert_eq!(server.engine.checkpoint().automaton, dfadev::automaton::Automaton::new());
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_ioctls() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();

    dev.ioctl(DFAIOCADD, &[0, b'a', 7]).await.unwrap();
    dev.ioctl(DFAIOCACCEPT, &[7]).await.unwrap();
    dev.write(b"a").await.unwrap();
    assert!(dev.fin().await.unwrap());

    let err = dev.ioctl(0x5401, &[]).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
    assert!(err.is_io());

    let err = dev.ioctl(DFAIOCADD, &[0, 1]).await.unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    assert!(err.is_io());
    assert_eq!(server.engine.checkpoint().automaton.transition(0, 1), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn transfers_above_the_device_limit() {
    let limits = Limits { max_write: 16, max_read: 16 };
    let server = spawn(Engine::new(), limits).await;
    let mut dev = Device::open(&server.addr).await.unwrap();

    assert!(matches!(dev.read(17).await, Err(Error::OutOfRange(17))));
    assert_eq!(dev.read(16).await.unwrap(), vec![REJECT; 16]);
    assert_eq!(dev.write(&[0; 16]).await.unwrap(), 16);
    // The refused body is left unread, so this may also end the connection.
    assert!(matches!(dev.write(&[0; 17]).await, Err(Error::OutOfRange(17))));
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_throughput() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    odd_length(&mut dev).await;

    let data = vec![b'x'; 10_000_001];
    assert_eq!(dev.write(&data).await.unwrap(), data.len());
    let status = dev.read(10_000_000).await.unwrap();
    assert_eq!(status.len(), 10_000_000);
    assert!(status.iter().all(|&b| b == ACCEPT));

    dev.write(&data).await.unwrap();
    let status = dev.read(10_000_000).await.unwrap();
    assert_eq!(status.len(), 10_000_000);
    assert!(status.iter().all(|&b| b == REJECT));
}

// x+ y+ x: reaching state 3 means a `y` landed inside a run of `x`.
fn x_then_y_then_x() -> Vec<Command> {
    let (x, y) = (b'x' as i64, b'y' as i64);
    let mut commands = vec![
        Command::Reset,
        Command::AddTransition { p: 0, a: x, q: 1 },
        Command::AddTransition { p: 1, a: x, q: 1 },
        Command::AddTransition { p: 1, a: y, q: 2 },
        Command::AddTransition { p: 2, a: y, q: 2 },
        Command::AddTransition { p: 2, a: x, q: 3 },
    ];
    commands.extend((0..256).map(|a| Command::AddTransition { p: 3, a, q: 3 }));
    commands.push(Command::Accept { p: 3 });
    commands
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writes_stay_whole() {
    let server = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&server.addr).await.unwrap();
    dev.control(&x_then_y_then_x()).await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let bulk = {
        let addr = server.addr.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut dev = Device::open(&addr).await.unwrap();
            let data = vec![b'x'; 3 * Device::CHUNK];
            assert_eq!(dev.write(&data).await.unwrap(), data.len());
            done.store(true, Ordering::SeqCst);
        })
    };
    let small = {
        let addr = server.addr.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut dev = Device::open(&addr).await.unwrap();
            let mut writes = 0usize;
            while !done.load(Ordering::SeqCst) {
                dev.write(b"y").await.unwrap();
                writes += 1;
            }
            writes
        })
    };

    bulk.await.unwrap();
    assert!(small.await.unwrap() > 0);
    assert!(!dev.fin().await.unwrap());
    assert_ne!(server.engine.checkpoint().automaton.current(), 3);
}

// Every symbol moves p to p + 1, so the state counts bytes written modulo 256.
fn counter() -> Vec<Command> {
    (0..256i64)
        .flat_map(|p| (0..256i64).map(move |a| Command::AddTransition { p, a, q: (p + 1) % 256 }))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn write_straddling_an_upgrade_is_whole_or_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path().join("state.sqlite3")).await.unwrap();

    let old = spawn(Engine::new(), Limits::default()).await;
    let mut dev = Device::open(&old.addr).await.unwrap();
    dev.control(&counter()).await.unwrap();
    assert_eq!(old.engine.checkpoint().automaton.current(), 0);

    let len = (32 << 20) + 1;
    let writer = tokio::spawn(async move {
        let data = vec![0u8; len];
        dev.write(&data).await
    });
    Device::open(&old.addr).await.unwrap().update().await.unwrap();

    old.task.await.unwrap();
    let written = writer.await.unwrap();
    let snapshot = upgrade::hand_off(&old.engine, &store, "dfa").await.unwrap();

    match written {
        Ok(n) => {
            assert_eq!(n, len);
            assert_eq!(snapshot.automaton.current(), (len % 256) as u8);
        }
        // Nothing or all of it, never part.
        Err(_) => assert!([0, (len % 256) as u8].contains(&snapshot.automaton.current())),
    }

    let engine = upgrade::start(InitMode::LiveUpdate, &store, "dfa").await.unwrap();
    assert_eq!(engine.checkpoint().automaton, snapshot.automaton);
}

#[tokio::test(flavor = "multi_thread")]
async fn state_survives_live_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path().join("state.sqlite3")).await.unwrap();

    let old = spawn(Engine::new(), Limits::default()).await;
    {
        let mut dev = Device::open(&old.addr).await.unwrap();
        odd_length(&mut dev).await;
        assert!(!dev.fin().await.unwrap(), "bad init state");
        dev.write(b"x").await.unwrap();
        assert!(dev.fin().await.unwrap(), "does not accept odd length before update");
    }

    // An idle connection must not hold the upgrade up.
    let mut idle = Device::open(&old.addr).await.unwrap();
    idle.ping().await.unwrap();

    Device::open(&old.addr).await.unwrap().update().await.unwrap();
    old.task.await.unwrap();
    assert!(idle.ping().await.is_err());
    assert!(Device::open(&old.addr).await.is_err());

    upgrade::hand_off(&old.engine, &store, "dfa").await.unwrap();
    let engine = upgrade::start(InitMode::LiveUpdate, &store, "dfa").await.unwrap();
    let new = spawn(engine, Limits::default()).await;

    let mut dev = Device::open(&new.addr).await.unwrap();
    assert_eq!(dev.instance().await.unwrap().generation, 1);
    assert!(dev.fin().await.unwrap(), "does not accept odd length after update");
    dev.write(b"x").await.unwrap();
    assert!(!dev.fin().await.unwrap(), "bad fini state");
}

#[tokio::test(flavor = "multi_thread")]
async fn update_waits_for_the_successor() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(dir.path().join("state.sqlite3")).await.unwrap();

    let old = spawn(Engine::new(), Limits::default()).await;
    let addr = old.addr.clone();
    {
        let mut dev = Device::open(&addr).await.unwrap();
        odd_length(&mut dev).await;
        dev.write(b"abc").await.unwrap();
    }

    // Stand-in for the process replacing itself: same address, store taken over.
    let successor = {
        let addr = addr.clone();
        tokio::spawn(async move {
            old.task.await.unwrap();
            upgrade::hand_off(&old.engine, &store, "dfa").await.unwrap();
            let engine = upgrade::start(InitMode::LiveUpdate, &store, "dfa").await.unwrap();
            let listener = TcpListener::bind(&addr).await.unwrap();
            spawn_on(listener, Arc::new(engine), Limits::default()).await
        })
    };

    let instance = client::update(&addr, Duration::from_secs(10)).await.unwrap();
    assert_eq!(instance.generation, 1);
    let _new = successor.await.unwrap();

    let mut dev = Device::open(&addr).await.unwrap();
    assert!(dev.fin().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_status_is_detected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"YZ"))))
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });

    let mut dev = Device::open(&addr).await.unwrap();
    assert!(matches!(dev.read(2).await, Err(Error::MalformedStatusByte(b'Z'))));
}
