// Copyright 2020 Joyent, Inc.

use std::fmt;

/// The port number for a backend server. This is a type alias for u16.
pub type BackendPort = u16;
/// The concatenation of the backend host and port with a colon
/// delimiter. This is a type alias for String.
pub type BackendName = String;
/// The host of the backend server: an IP address or a DNS name. This is a
/// type alias for String.
pub type BackendHost = String;

/// A type representing the address of a backend server.
///
/// The pool treats every backend as logically equivalent; the only thing it
/// needs to know about one is where to dial it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Backend {
    /// The concatenation of the backend host and port with a colon delimiter.
    pub name: BackendName,
    /// The host of the backend.
    pub host: BackendHost,
    /// The port of the backend.
    pub port: BackendPort,
}

impl Backend {
    /// Return a new instance of `Backend` given a host and a `BackendPort`.
    pub fn new(host: &str, port: BackendPort) -> Self {
        Backend {
            name: backend_name(host, port),
            host: String::from(host),
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(fmt)
    }
}

// Concatenate the backend host and port with a colon delimiter.
fn backend_name(host: &str, port: BackendPort) -> BackendName {
    [String::from(host), String::from(":"), port.to_string()].concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_format() {
        let b = Backend::new("127.0.0.1", 6379);
        assert_eq!(b.name, "127.0.0.1:6379");
        assert_eq!(format!("{}", b), "127.0.0.1:6379");
    }

    #[test]
    fn backend_name_accepts_hostnames() {
        let b = Backend::new("cache-3.example.com", 11211);
        assert_eq!(b.name, "cache-3.example.com:11211");
        assert_eq!(b.port, 11211);
    }
}
