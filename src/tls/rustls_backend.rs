// Copyright (c) 2026 The Aioli developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! rustls-backed [`TlsSession`] implementation.

use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection};

use super::{HandshakeStatus, ShutdownStatus, TlsSession};
use crate::error::SocketError;
use crate::transport::Transport;

/// Shared TLS configuration for a server.
///
/// Internally an `Arc`, so cloning is cheap and every accepted connection
/// derives its session from the same configuration.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Builds a configuration from PEM files: a certificate chain and an RSA
    /// or PKCS#8 private key. DSA keys are not supported.
    pub fn from_pem_files<C, K>(cert_pem: C, key_pem: K) -> Result<TlsConfig, Box<dyn Error + Send + Sync>>
    where
        C: AsRef<Path>,
        K: AsRef<Path>,
    {
        let certs = load_certificates(cert_pem)?;
        let key = load_private_key(key_pem)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsConfig {
            config: Arc::new(config),
        })
    }

    /// Wraps an already-built rustls configuration.
    pub fn from_server_config(config: ServerConfig) -> TlsConfig {
        TlsConfig {
            config: Arc::new(config),
        }
    }

    /// Creates a session for one accepted connection.
    pub fn new_session(&self) -> Result<RustlsSession, rustls::Error> {
        Ok(RustlsSession {
            conn: ServerConnection::new(self.config.clone())?,
            plaintext_pending: false,
        })
    }
}

/// One rustls server session.
pub struct RustlsSession {
    conn: ServerConnection,
    plaintext_pending: bool,
}

// Adapts a Transport to the io::Read/Write pair rustls drives its records
// through, translating the classified errors back into io errors.
struct IoAdapter<'a> {
    io: &'a mut dyn Transport,
}

impl<'a> Read for IoAdapter<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.io.recv(buf) {
            Ok(n) => Ok(n),
            Err(SocketError::RemoteClosed) => Ok(0),
            Err(SocketError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(SocketError::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }
}

impl<'a> Write for IoAdapter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.io.send(buf, false) {
            Ok(n) => Ok(n),
            Err(SocketError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(SocketError::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RustlsSession {
    /// Pulls ciphertext off the socket into the session. `Ok(false)` means
    /// the socket had nothing to give right now.
    fn fill(&mut self, io: &mut dyn Transport) -> Result<bool, SocketError> {
        let mut adapter = IoAdapter { io };
        match self.conn.read_tls(&mut adapter) {
            Ok(0) => Err(SocketError::RemoteClosed),
            Ok(_) => {
                let state = self
                    .conn
                    .process_new_packets()
                    .map_err(|err| SocketError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))?;
                self.plaintext_pending = state.plaintext_bytes_to_read() > 0;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(SocketError::classify(err)),
        }
    }

    /// Flushes pending ciphertext to the socket. `Ok(false)` means the
    /// socket refused more bytes.
    fn drain(&mut self, io: &mut dyn Transport) -> Result<bool, SocketError> {
        let mut adapter = IoAdapter { io };
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut adapter) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
                Err(err) => return Err(SocketError::classify(err)),
            }
        }
        Ok(true)
    }
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self, io: &mut dyn Transport) -> Result<HandshakeStatus, SocketError> {
        loop {
            if self.conn.wants_write() && !self.drain(io)? {
                return Ok(HandshakeStatus::NeedsWrite);
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeStatus::Done);
            }
            if self.conn.wants_read() && !self.fill(io)? {
                return Ok(HandshakeStatus::NeedsRead);
            }
        }
    }

    fn recv(&mut self, io: &mut dyn Transport, buf: &mut [u8]) -> Result<usize, SocketError> {
        if !self.plaintext_pending {
            // May legitimately find nothing; the reader below decides.
            self.fill(io)?;
        }
        match self.conn.reader().read(buf) {
            Ok(0) => {
                self.plaintext_pending = false;
                Err(SocketError::RemoteClosed)
            }
            Ok(n) => {
                if n < buf.len() {
                    self.plaintext_pending = false;
                }
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.plaintext_pending = false;
                Err(SocketError::WouldBlock)
            }
            Err(err) => Err(SocketError::classify(err)),
        }
    }

    fn send(&mut self, io: &mut dyn Transport, buf: &[u8]) -> Result<usize, SocketError> {
        // rustls buffers unbounded plaintext unless told otherwise, so flush
        // first and refuse new plaintext while ciphertext is backed up.
        if !self.drain(io)? {
            return Err(SocketError::WouldBlock);
        }
        let written = self
            .conn
            .writer()
            .write(buf)
            .map_err(SocketError::classify)?;
        self.drain(io)?;
        Ok(written)
    }

    fn shutdown(&mut self, io: &mut dyn Transport) -> Result<ShutdownStatus, SocketError> {
        self.conn.send_close_notify();
        if self.drain(io)? {
            Ok(ShutdownStatus::Done)
        } else {
            Ok(ShutdownStatus::Pending)
        }
    }

    fn has_data_pending(&self) -> bool {
        self.plaintext_pending
    }
}

fn load_certificates<P>(path: P) -> Result<Vec<Certificate>, Box<dyn Error + Send + Sync>>
where
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|_| String::from("certificate PEM file contains invalid entries"))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key<P>(path: P) -> Result<PrivateKey, Box<dyn Error + Send + Sync>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let mut pkcs8_keys = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|_| String::from("private key PEM file contains invalid entries"))?
    };

    let mut rsa_keys = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::rsa_private_keys(&mut reader)
            .map_err(|_| String::from("private key PEM file contains invalid entries"))?
    };

    if !pkcs8_keys.is_empty() {
        Ok(PrivateKey(pkcs8_keys.remove(0)))
    } else if !rsa_keys.is_empty() {
        Ok(PrivateKey(rsa_keys.remove(0)))
    } else {
        Err(String::from("no usable private key in PEM file (DSA keys are not supported)").into())
    }
}
