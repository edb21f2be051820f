//! End-to-end scenarios exercising a `Server` and `Client` sharing a real
//! loop, each case matching one of the scenarios named in this crate's
//! reactor-core design (echo round-trip, high-water-mark, reconnect, timer
//! self-cancellation).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use angelreactor::evloop::EventLoop;
use angelreactor::server::Server;
use angelreactor::util::InetAddr;

fn any_local_addr() -> InetAddr {
    InetAddr::new("127.0.0.1:0".parse().unwrap())
}

#[test]
fn timer_self_cancel_in_callback_fires_exactly_three_times() {
    let mut evloop = EventLoop::new().unwrap();
    let handle = evloop.handle();

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let quit_handle = handle.clone();
    let cancel_handle = handle.clone();
    let timer_id = Arc::new(Mutex::new(0));
    let id_for_cb = timer_id.clone();

    let id = handle.run_every(10, move || {
        let n = t.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            let id = *id_for_cb.lock().unwrap();
            cancel_handle.cancel_timer(id);
            quit_handle.quit();
        }
    });
    *timer_id.lock().unwrap() = id;

    evloop.run();
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[test]
fn cross_thread_sends_never_interleave_on_the_wire() {
    use std::io::Read;

    let mut evloop = EventLoop::new().unwrap();
    let handle = evloop.handle();
    let server = Server::new(handle.clone(), any_local_addr()).unwrap();

    let conn_slot: Arc<Mutex<Option<angelreactor::connection::ConnectionRef>>> =
        Arc::new(Mutex::new(None));
    let slot = conn_slot.clone();
    server.set_connection_handler(Arc::new(move |conn| {
        *slot.lock().unwrap() = Some(conn.clone());
    }));

    server.start(&mut evloop).unwrap();
    let addr = server.listen_addr().addr();

    let received = Arc::new(Mutex::new(Vec::new()));
    let rcv = received.clone();
    let reader = std::thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        *rcv.lock().unwrap() = buf.to_vec();
    });

    std::thread::sleep(Duration::from_millis(50));
    let conn = conn_slot.lock().unwrap().clone().expect("connection accepted");

    let c1 = conn.clone();
    let c2 = conn.clone();
    let s1 = std::thread::spawn(move || c1.send(b"A"));
    let s2 = std::thread::spawn(move || c2.send(b"B"));
    s1.join().unwrap();
    s2.join().unwrap();

    reader.join().unwrap();
    let quit_handle = handle.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        quit_handle.quit();
    });
    evloop.run();

    let got = received.lock().unwrap().clone();
    assert!(got == b"AB".to_vec() || got == b"BA".to_vec());
}

// A peer-initiated close is observed here as a 0-byte read, same as any other
// EOF; per connection::handle_read's ported semantics that always sets
// reset_by_peer, so a graceful client close and an abrupt reset are
// indistinguishable from the server's side of a plain read() loop.
#[test]
fn echo_round_trip_then_close_sets_reset_by_peer_on_eof() {
    let mut evloop = EventLoop::new().unwrap();
    let handle = evloop.handle();
    let server = Server::new(handle.clone(), any_local_addr()).unwrap();

    server.set_message_handler(Arc::new(|conn, buf| {
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        conn.send(&data);
    }));

    let closed_reset = Arc::new(Mutex::new(None));
    let cr = closed_reset.clone();
    let quit_handle = handle.clone();
    server.set_close_handler(Arc::new(move |conn| {
        *cr.lock().unwrap() = Some(conn.is_reset_by_peer());
        quit_handle.quit();
    }));

    server.start(&mut evloop).unwrap();
    let addr = server.listen_addr().addr();

    std::thread::spawn(move || {
        use std::io::{Read, Write};
        std::thread::sleep(Duration::from_millis(30));
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");
        drop(stream);
    });

    evloop.run();
    assert_eq!(*closed_reset.lock().unwrap(), Some(true));
}

#[test]
fn high_water_mark_fires_exactly_once_when_peer_never_reads() {
    let mut evloop = EventLoop::new().unwrap();
    let handle = evloop.handle();
    let server = Server::new(handle.clone(), any_local_addr()).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    server.set_high_water_mark_handler(
        1024,
        Arc::new(move |_conn| {
            f.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let connected = Arc::new(AtomicBool::new(false));
    let c = connected.clone();
    server.set_connection_handler(Arc::new(move |conn| {
        c.store(true, Ordering::SeqCst);
        // A handful of KB would just sit in the kernel's send buffer and
        // `write_raw` would report the whole thing written, leaving nothing
        // queued in `output_buf` for the threshold check to see. Send far
        // more than any platform's default SO_SNDBUF so this one `send`
        // call reliably produces a short write and queues the residue.
        conn.send(&vec![0u8; 64 * 1024 * 1024]);
    }));

    let quit_handle = handle.clone();
    server.set_close_handler(Arc::new(move |_conn| quit_handle.quit()));

    server.start(&mut evloop).unwrap();
    let addr = server.listen_addr().addr();

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        let stream = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        drop(stream);
    });

    let quit_fallback = handle.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(2));
        quit_fallback.quit();
    });

    evloop.run();
    assert!(connected.load(Ordering::SeqCst));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
