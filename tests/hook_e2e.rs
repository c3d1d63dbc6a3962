//! End-to-end coverage of the `hooks` feature's blocking-call wrappers.
//! Only compiled when the feature is enabled (`cargo test --features hooks`).

#![cfg(feature = "hooks")]

use corort::config::Config;
use corort::fiber::Fiber;
use corort::hook;
use corort::reactor::Reactor;
use corort::scheduler::Task;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Scenario 3: connecting to an address nothing answers on, with a 200ms
/// timeout, returns an error within 180-250ms rather than hanging.
#[test]
fn connect_with_timeout_reports_timeout_promptly() {
    let reactor = Reactor::new(Config::builder().worker_threads(1).build());
    reactor.start();

    // TEST-NET-1 (RFC 5737): guaranteed unroutable, so the SYN is dropped
    // silently rather than rejected, forcing the timeout path (not an
    // immediate ECONNREFUSED).
    let addr: std::net::SocketAddr = "192.0.2.1:9".parse().unwrap();

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    let elapsed = Arc::new(Mutex::new(None));
    let elapsed2 = Arc::clone(&elapsed);

    reactor.scheduler().schedule(
        Task::Fiber(Fiber::new("connector", move || {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            let sockaddr: libc::sockaddr_in = unsafe {
                let mut sa: libc::sockaddr_in = std::mem::zeroed();
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = addr.port().to_be();
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    sa.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
                }
                sa
            };
            let start = Instant::now();
            let rc = hook::connect(
                fd,
                unsafe { &*(&sockaddr as *const _ as *const libc::sockaddr) },
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                Some(Duration::from_millis(200)),
            );
            *elapsed2.lock().unwrap() = Some(start.elapsed());
            *result2.lock().unwrap() = Some(rc.is_err());
            unsafe {
                libc::close(fd);
            }
        })),
        -1,
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    while result.lock().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    reactor.stop();

    assert_eq!(*result.lock().unwrap(), Some(true), "connect should report a timeout error");
    let took = elapsed.lock().unwrap().unwrap();
    assert!(
        took >= Duration::from_millis(150) && took <= Duration::from_millis(500),
        "connect timeout fired after {took:?}, expected roughly 200ms"
    );
}

/// `hook::accept` suspends until a peer connects, same shape as the raw
/// syscall but yielding instead of blocking.
#[test]
fn hooked_accept_yields_until_a_peer_connects() {
    let reactor = Reactor::new(Config::builder().worker_threads(1).build());
    reactor.start();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let fd = listener.as_raw_fd();

    let accepted = Arc::new(Mutex::new(false));
    let accepted2 = Arc::clone(&accepted);
    reactor.scheduler().schedule(
        Task::Fiber(Fiber::new("acceptor", move || {
            if hook::accept(fd, Some(Duration::from_secs(2))).is_ok() {
                *accepted2.lock().unwrap() = true;
            }
        })),
        -1,
    );

    std::thread::sleep(Duration::from_millis(30));
    let _client = std::net::TcpStream::connect(addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while !*accepted.lock().unwrap() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    reactor.stop();
    assert!(*accepted.lock().unwrap());
}
