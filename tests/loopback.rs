//! End-to-end protocol scenarios over the soft fabric: one thread per
//! process role, real TCP on localhost.

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use onesided::{
    ConnParams, Driver, EventKind, Fabric, SoftFabric, TransferConfig, TransferError, TransferMode,
};

fn start_server(cfg: TransferConfig) -> (u16, thread::JoinHandle<Result<Vec<u8>, TransferError>>) {
    let driver = Driver::server(SoftFabric::new(), cfg, 0).expect("server start");
    let port = driver.local_port();
    (port, thread::spawn(move || driver.run()))
}

fn run_client(cfg: TransferConfig, port: u16) -> Result<Vec<u8>, TransferError> {
    Driver::client(SoftFabric::new(), cfg, "127.0.0.1", port)?.run()
}

fn as_le_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[test]
fn write_round_trip() -> Result<()> {
    // The client pushes four little-endian u32s; after its completion the
    // server's scratch buffer must hold the same 16 bytes.
    let payload = as_le_bytes(&[0, 1, 2, 3]);
    let (port, server) = start_server(TransferConfig::new(TransferMode::Write).with_buffer_len(16));

    let client_buf = run_client(
        TransferConfig::new(TransferMode::Write)
            .with_buffer_len(16)
            .with_payload(payload.clone()),
        port,
    )?;
    assert_eq!(client_buf, payload);

    let server_buf = server.join().expect("server thread")?;
    assert_eq!(server_buf, payload);
    Ok(())
}

#[test]
fn read_round_trip() -> Result<()> {
    // The server pre-fills its buffer with a known pattern; the client's
    // READ must pull exactly that pattern.
    let pattern = as_le_bytes(&[10, 20, 30, 40]);
    let (port, server) = start_server(
        TransferConfig::new(TransferMode::Read)
            .with_buffer_len(16)
            .with_payload(pattern.clone()),
    );

    let client_buf = run_client(
        TransferConfig::new(TransferMode::Read).with_buffer_len(16),
        port,
    )?;
    assert_eq!(client_buf, pattern);

    let server_buf = server.join().expect("server thread")?;
    assert_eq!(server_buf, pattern);
    Ok(())
}

#[test]
fn read_full_buffer_pattern() -> Result<()> {
    let pattern: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(3)).collect();
    let (port, server) = start_server(
        TransferConfig::new(TransferMode::Read)
            .with_buffer_len(64)
            .with_payload(pattern.clone()),
    );

    let client_buf = run_client(
        TransferConfig::new(TransferMode::Read).with_buffer_len(64),
        port,
    )?;
    assert_eq!(client_buf, pattern);

    server.join().expect("server thread")?;
    Ok(())
}

#[test]
fn connect_to_dead_port_fails_cleanly() -> Result<()> {
    // Grab an ephemeral port and free it again: nothing listens there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let err = run_client(
        TransferConfig::new(TransferMode::Read).with_buffer_len(16),
        port,
    )
    .expect_err("no listener, must fail");
    assert!(matches!(err, TransferError::Connect));
    Ok(())
}

#[test]
fn unresolvable_address_fails_cleanly() {
    let cfg = TransferConfig::new(TransferMode::Read).with_buffer_len(16);
    let err = Driver::client(SoftFabric::new(), cfg, "not a host name", 1)
        .and_then(|d| d.run())
        .expect_err("bogus host must fail");
    assert!(matches!(err, TransferError::AddrResolution));
}

#[test]
fn mode_mismatch_is_rejected_then_server_keeps_serving() -> Result<()> {
    let pattern = as_le_bytes(&[7, 7, 7, 7]);
    let (port, server) = start_server(
        TransferConfig::new(TransferMode::Read)
            .with_buffer_len(16)
            .with_payload(pattern.clone()),
    );

    // A write-mode client against a read-mode server fails at a defined
    // point: the server rejects the connect request.
    let err = run_client(
        TransferConfig::new(TransferMode::Write)
            .with_buffer_len(16)
            .with_payload(vec![0xab; 16]),
        port,
    )
    .expect_err("mismatched mode must be rejected");
    assert!(matches!(err, TransferError::Rejected));

    // The rejection did not end the serve loop; a matching client still
    // gets the data.
    let client_buf = run_client(
        TransferConfig::new(TransferMode::Read).with_buffer_len(16),
        port,
    )?;
    assert_eq!(client_buf, pattern);

    // The server's buffer was never written by the rejected client.
    let server_buf = server.join().expect("server thread")?;
    assert_eq!(server_buf, pattern);
    Ok(())
}

#[test]
fn disconnect_before_exchange_tears_down_cleanly() -> Result<()> {
    // The peer disconnects right after establishment, before sending its
    // descriptor. The server must tear down without ever touching the
    // unpopulated peer descriptor buffer.
    let (port, server) = start_server(TransferConfig::new(TransferMode::Write).with_buffer_len(16));

    let mut fabric = SoftFabric::new();
    let timeout = Duration::from_millis(500);
    let id = fabric.resolve_addr("127.0.0.1", port, timeout)?;
    loop {
        let event = fabric.next_event()?;
        assert_eq!(event.conn, id);
        match event.kind {
            EventKind::AddrResolved => fabric.resolve_route(id, timeout)?,
            EventKind::RouteResolved => fabric.connect(id, &ConnParams::new(TransferMode::Write))?,
            EventKind::Established => fabric.disconnect(id)?,
            EventKind::Disconnected => {
                fabric.destroy_id(id)?;
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // The server observed the disconnect and completed teardown.
    let server_buf = server.join().expect("server thread")?;
    assert_eq!(server_buf, vec![0u8; 16]);
    Ok(())
}
