//! Network frontends: the TCP RPC server and the UDP discovery responder.
//!
//! RPC requests are handled strictly one at a time on the server task; the
//! discovery responder and the claim watchdog run on their own tasks.

use std::fmt;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::periph::PeripheralManager;
use crate::rpc;

pub const DEFAULT_RPC_PORT: u16 = 49601;
pub const DEFAULT_DISCOVERY_PORT: u16 = 49600;

const DISCOVERY_PREAMBLE: &[u8] = b"MPM-DISC";

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Rpc(rpc::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(error) => write!(f, "io error: {}", error),
            Error::Rpc(error) => write!(f, "rpc error: {}", error),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<rpc::Error> for Error {
    fn from(error: rpc::Error) -> Self {
        Error::Rpc(error)
    }
}

fn handle_connection(mpm: &PeripheralManager, stream: TcpStream) -> Result<(), Error> {
    let _ = stream.set_nodelay(true);
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    loop {
        let request = match rpc::read_request(&mut reader)? {
            Some(request) => request,
            None => {
                info!("peer closed connection");
                return Ok(());
            }
        };
        match mpm.dispatch(&request.method, &request.args) {
            Ok(value) => rpc::write_reply_ok(&mut writer, &value)?,
            Err(message) => {
                debug!("{} failed: {}", request.method, message);
                rpc::write_reply_err(&mut writer, &message)?;
            }
        }
        writer.flush()?;
    }
}

/// Serves RPC connections forever, one at a time.
pub fn serve(mpm: Arc<PeripheralManager>, listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("received connection from {}", peer);
                if let Err(error) = handle_connection(&mpm, stream) {
                    warn!("connection terminated: {}", error);
                }
            }
            Err(error) => warn!("accept failed: {}", error),
        }
    }
}

pub fn rpc_main(mpm: Arc<PeripheralManager>, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!("RPC server on port {}", port);
    serve(mpm, listener);
    Ok(())
}

/// Answers discovery broadcasts with the device identity line.
pub fn discovery_main(mpm: Arc<PeripheralManager>, port: u16) -> io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    socket.set_broadcast(true)?;
    info!("discovery responder on port {}", port);
    let mut buffer = [0u8; 256];
    loop {
        let (length, peer) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(error) => {
                warn!("discovery receive failed: {}", error);
                continue;
            }
        };
        if buffer[..length].starts_with(DISCOVERY_PREAMBLE) {
            debug!("discovery request from {}", peer);
            let _ = socket.send_to(mpm.discovery_info().as_bytes(), peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{read_reply, write_request, Request, Value};
    use std::thread;

    // End-to-end over a real socket pair: claim, keep-alive, query, unclaim.
    #[test]
    fn rpc_session_over_tcp() {
        let mpm = crate::periph::testing::test_mpm(std::time::Duration::from_secs(2));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let mpm = mpm.clone();
            thread::spawn(move || serve(mpm, listener));
        }

        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = BufWriter::new(stream);

        let mut call = |method: &str, args: Vec<Value>| {
            write_request(
                &mut writer,
                &Request {
                    method: method.to_string(),
                    args,
                },
            )
            .unwrap();
            writer.flush().unwrap();
            read_reply(&mut reader).unwrap()
        };

        let token = match call("claim", vec![Value::Str("host".to_string())]) {
            Ok(Value::Str(token)) => token,
            other => panic!("claim failed: {:?}", other),
        };
        assert!(!token.is_empty());
        assert_eq!(
            call("reclaim", vec![Value::Str(token.clone())]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("get_num_timekeepers", vec![Value::Str(token.clone())]),
            Ok(Value::U64(2))
        );
        assert_eq!(
            call("reclaim", vec![Value::Str("bogus".to_string())]),
            Err("bad token".to_string())
        );
        assert_eq!(
            call("unclaim", vec![Value::Str(token)]),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn discovery_answers_preamble_only() {
        let mpm = crate::periph::testing::test_mpm(std::time::Duration::from_secs(2));
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let info = mpm.discovery_info();
        thread::spawn(move || {
            let mut buffer = [0u8; 256];
            loop {
                let (length, peer) = server.recv_from(&mut buffer).unwrap();
                if buffer[..length].starts_with(DISCOVERY_PREAMBLE) {
                    let _ = server.send_to(mpm.discovery_info().as_bytes(), peer);
                }
            }
        });

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        client.send_to(b"MPM-DISC", server_addr).unwrap();
        let mut buffer = [0u8; 256];
        let (length, _) = client.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..length], info.as_bytes());

        // Unrelated datagrams are ignored.
        client.send_to(b"HELLO", server_addr).unwrap();
        client.send_to(b"MPM-DISC", server_addr).unwrap();
        let (length, _) = client.recv_from(&mut buffer).unwrap();
        assert!(buffer[..length].starts_with(b"MPM-DISC;type="));
    }
}
