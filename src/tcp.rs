// Copyright 2020 Joyent, Inc.

use std::io::{Error as IOError, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};

use crate::backend::Backend;
use crate::connection::{Connection, ConnectionTimeouts};

/// A stock [`Connection`](../connection/trait.Connection.html) implementation
/// wrapping a `TcpStream`. The connect timeout bounds the dial and the data
/// timeout is applied to the socket as its read and write timeout.
#[derive(Debug)]
pub struct TcpStreamConnection {
    pub stream: Option<TcpStream>,
    name: String,
    timeouts: ConnectionTimeouts,
}

impl TcpStreamConnection {
    pub fn new(b: &Backend, timeouts: &ConnectionTimeouts) -> Self {
        TcpStreamConnection {
            stream: None,
            name: b.name.clone(),
            timeouts: *timeouts,
        }
    }

    // Resolve the backend name to a socket address. A DNS name may resolve
    // to several addresses; the first one is used.
    fn resolve(&self) -> Result<SocketAddr, IOError> {
        self.name.to_socket_addrs()?.next().ok_or_else(|| {
            IOError::new(
                ErrorKind::AddrNotAvailable,
                format!("no address found for {}", self.name),
            )
        })
    }
}

impl Connection for TcpStreamConnection {
    type Error = IOError;

    fn connect(&mut self) -> Result<(), IOError> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.timeouts.connect)?;
        stream.set_read_timeout(Some(self.timeouts.data))?;
        stream.set_write_timeout(Some(self.timeouts.data))?;
        self.stream = Some(stream);
        Ok(())
    }
}

impl Deref for TcpStreamConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream.as_ref().unwrap()
    }
}

impl DerefMut for TcpStreamConnection {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().unwrap()
    }
}
