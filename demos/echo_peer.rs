//! Echo peer - serve or call an `Echo` method over a socket address.
//!
//! # Running
//!
//! ```text
//! RUST_LOG=buswire=debug cargo run --example echo_peer -- listen unix:path=/tmp/echo.sock
//! cargo run --example echo_peer -- call unix:path=/tmp/echo.sock "hello there"
//! ```
//!
//! The listening side multiplexes every accepted peer on one [`Reactor`].

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use buswire::codec::{Arg, BodyWriter};
use buswire::handler::{BusObject, Reply};
use buswire::protocol::{Endian, Frame};
use buswire::transport::{BusAddress, SockListener};
use buswire::{Connection, ConnectionBuilder, Reactor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ECHO_PATH: &str = "/org/example/Echo";
const ECHO_INTERFACE: &str = "org.example.Echo";

fn echo_object() -> BusObject {
    BusObject::new().method(ECHO_INTERFACE, "Echo", "s", "s", |_conn, call| {
        let text = call.body_reader().read_str()?.to_owned();
        info!(%text, "echo");
        Ok(Reply::args(call.endian(), &[Arg::Str(text)])?)
    })
}

fn listen(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let address: BusAddress = address.parse()?;
    let listener = Rc::new(SockListener::bind(&address)?);
    info!(address = %listener.local_address(), "listening");

    let mut reactor = Reactor::new()?;
    let peers: Rc<RefCell<Vec<Rc<RefCell<Connection>>>>> = Rc::default();

    let accept_from = listener.clone();
    reactor.on_readable(
        listener.as_raw_fd(),
        Some(Box::new(move |reactor| {
            let stream = match accept_from.accept() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            let conn = match ConnectionBuilder::new().responder(stream) {
                Ok(conn) => Rc::new(RefCell::new(conn)),
                Err(e) => {
                    warn!(error = %e, "responder setup failed");
                    return;
                }
            };
            if let Err(e) = conn.borrow_mut().register(ECHO_PATH, echo_object()) {
                warn!(error = %e, "register failed");
                return;
            }
            if let Err(e) = Connection::attach(&conn, reactor) {
                warn!(error = %e, "attach failed");
                return;
            }
            let mut peers = peers.borrow_mut();
            peers.retain(|p| !p.borrow().is_closed());
            peers.push(conn);
            info!(peers = peers.len(), "peer accepted");
        })),
    );

    loop {
        reactor.run_once(None)?;
    }
}

fn call(address: &str, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = ConnectionBuilder::new()
        .reply_timeout(Duration::from_secs(5))
        .connect(address)?;

    let mut body = BodyWriter::new(Endian::native());
    body.write_str(text)?;
    let request = Frame::method_call(None, ECHO_PATH, Some(ECHO_INTERFACE), "Echo")
        .with_body("s", body.into_bytes());

    let reply = conn.send_and_await_reply(request)?;
    println!("{}", reply.body_reader().read_str()?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["listen", address] => listen(address),
        ["call", address, text] => call(address, text),
        _ => {
            eprintln!("usage: echo_peer listen <address> | call <address> <text>");
            std::process::exit(2);
        }
    }
}
