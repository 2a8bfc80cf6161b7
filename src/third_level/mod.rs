//! Client of the external third-level relay.
//!
//! Wire contract: ASCII line framing for control (`ready\n`, then either
//! `sendSubspaces\n` or `receiveSubspaces\n` from the relay), and
//! u64-little-endian byte-length-prefixed binary blocks for payloads, in
//! common-subspace order.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytemuck::Pod;

use crate::combi_error::CombiError;

/// Which side of the exchange the relay assigned to this system.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelayInstruction {
    /// Gather and send first, receive the reduced result after.
    SendFirst,
    /// Receive the remote data first, reduce locally, send the result back.
    ReceiveFirst,
}

const IO_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPTS: usize = 100;

/// Blocking TCP client of the relay daemon.
pub struct ThirdLevelClient {
    reader: BufReader<TcpStream>,
}

impl ThirdLevelClient {
    /// Connect to the relay, retrying briefly while it starts up.
    pub fn connect(host: &str, port: u16) -> Result<Self, CombiError> {
        let addr = format!("{}:{}", host, port);
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(IO_TIMEOUT))
                        .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)))
                        .map_err(|e| CombiError::Relay(e.to_string()))?;
                    stream
                        .set_nodelay(true)
                        .map_err(|e| CombiError::Relay(e.to_string()))?;
                    return Ok(Self {
                        reader: BufReader::new(stream),
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(CONNECT_RETRY);
                }
            }
        }
        Err(CombiError::Relay(format!(
            "cannot reach relay at {}: {}",
            addr,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn stream(&mut self) -> &mut TcpStream {
        self.reader.get_mut()
    }

    fn read_line(&mut self) -> Result<String, CombiError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.reader
                .read_exact(&mut byte)
                .map_err(|e| CombiError::Relay(format!("control read failed: {}", e)))?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 64 {
                return Err(CombiError::Relay("oversized control line".into()));
            }
        }
        String::from_utf8(line).map_err(|_| CombiError::Relay("non-UTF-8 control line".into()))
    }

    /// Announce that local and global reduction completed on this system.
    pub fn signal_ready(&mut self) -> Result<(), CombiError> {
        self.stream()
            .write_all(b"ready\n")
            .map_err(|e| CombiError::Relay(format!("ready write failed: {}", e)))
    }

    /// Block until the relay assigns this system its role for the step.
    pub fn fetch_instruction(&mut self) -> Result<RelayInstruction, CombiError> {
        match self.read_line()?.as_str() {
            "sendSubspaces" => Ok(RelayInstruction::SendFirst),
            "receiveSubspaces" => Ok(RelayInstruction::ReceiveFirst),
            other => Err(CombiError::Relay(format!(
                "unexpected relay instruction {:?}",
                other
            ))),
        }
    }

    /// Send one length-prefixed binary block.
    pub fn send_block<T: Pod>(&mut self, data: &[T]) -> Result<(), CombiError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let stream = self.stream();
        stream
            .write_all(&(bytes.len() as u64).to_le_bytes())
            .and_then(|_| stream.write_all(bytes))
            .map_err(|e| CombiError::Relay(format!("payload write failed: {}", e)))
    }

    /// Receive one length-prefixed binary block.
    pub fn recv_block<T: Pod>(&mut self) -> Result<Vec<T>, CombiError> {
        let mut len_buf = [0u8; 8];
        self.reader
            .read_exact(&mut len_buf)
            .map_err(|e| CombiError::Relay(format!("payload length read failed: {}", e)))?;
        let nbytes = u64::from_le_bytes(len_buf) as usize;
        if nbytes % std::mem::size_of::<T>() != 0 {
            return Err(CombiError::Relay(format!(
                "payload of {} bytes is not a whole element array",
                nbytes
            )));
        }
        let mut buf = vec![0u8; nbytes];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| CombiError::Relay(format!("payload read failed: {}", e)))?;
        Ok(bytemuck::pod_collect_to_vec(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    #[test]
    fn handshake_and_block_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let relay = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut ready = [0u8; 6];
            conn.read_exact(&mut ready).unwrap();
            assert_eq!(&ready, b"ready\n");
            conn.write_all(b"sendSubspaces\n").unwrap();
            // echo one block back
            let mut len = [0u8; 8];
            conn.read_exact(&mut len).unwrap();
            let mut payload = vec![0u8; u64::from_le_bytes(len) as usize];
            conn.read_exact(&mut payload).unwrap();
            conn.write_all(&len).unwrap();
            conn.write_all(&payload).unwrap();
        });

        let mut client = ThirdLevelClient::connect("127.0.0.1", port).unwrap();
        client.signal_ready().unwrap();
        assert_eq!(
            client.fetch_instruction().unwrap(),
            RelayInstruction::SendFirst
        );
        let sent = vec![1.5f64, -2.5, 0.0];
        client.send_block(&sent).unwrap();
        let got: Vec<f64> = client.recv_block().unwrap();
        assert_eq!(got, sent);
        relay.join().unwrap();
    }

    #[test]
    fn unknown_instruction_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"quit\n").unwrap();
        });
        let mut client = ThirdLevelClient::connect("127.0.0.1", port).unwrap();
        assert!(client.fetch_instruction().is_err());
        relay.join().unwrap();
    }
}
