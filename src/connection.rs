// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A real FTP session over TCP.

use std::io;
use std::io::prelude::*;
use std::io::BufReader;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use regex::Regex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::address::Address;
use crate::options::Options;
use crate::proto::{ReadReply, Reply, WriteCommand};
use crate::session::{Connector, Session};
use crate::Result;

/// How often to check for an incoming active-mode data connection.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// A logged-in control connection, plus whatever data connection is open.
pub struct FtpStream {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
    passive: bool,
    timeout: Duration,
    /// Set after an I/O error, or an abandoned transfer, leaves the control
    /// channel out of step with the server.
    broken: bool,
}

/// Where the server will send data, before the transfer command is sent.
enum DataChannel {
    Passive(TcpStream),
    Active(TcpListener),
}

impl FtpStream {
    /// Open the control connection and read the server's greeting.
    pub fn connect(address: &Address, options: &Options) -> Result<FtpStream> {
        let host_port = address.host_port();
        let addrs: Vec<SocketAddr> = host_port
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", host_port))?
            .collect();
        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            match connect_socket(*addr, options.timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(err)) => {
                return Err(err).with_context(|| format!("Failed to connect to {}", host_port))
            }
            (None, None) => bail!("{} resolved to no addresses", host_port),
        };
        FtpStream::from_stream(stream, options)
    }

    /// Take over an already-connected control stream and read the greeting.
    pub fn from_stream(stream: TcpStream, options: &Options) -> Result<FtpStream> {
        stream.set_read_timeout(Some(options.timeout))?;
        stream.set_write_timeout(Some(options.timeout))?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        let mut ftp = FtpStream {
            reader: BufReader::new(stream),
            writer,
            peer,
            passive: options.passive,
            timeout: options.timeout,
            broken: false,
        };
        let greeting = ftp.final_reply()?.expect(&[220])?;
        debug!("connected to {}: {}", peer, greeting.text());
        Ok(ftp)
    }

    /// Log in, sending the password only if the server asks for it.
    pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("USER {}", user))?;
        let reply = if reply.code == 331 {
            self.command(&format!("PASS {}", password))?
        } else {
            reply
        };
        reply
            .expect(&[230, 202])
            .with_context(|| format!("Login as {:?} failed", user))?;
        Ok(())
    }

    /// Address of the server's end of the control connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn check_usable(&self) -> Result<()> {
        if self.broken {
            Err(io::Error::new(io::ErrorKind::NotConnected, "control connection is out of step").into())
        } else {
            Ok(())
        }
    }

    /// Remember I/O failures: after one, the session can't be trusted.
    fn io<T>(&mut self, result: io::Result<T>) -> Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        Ok(result?)
    }

    /// Read one reply, skipping any preliminary (1xx) replies.
    fn final_reply(&mut self) -> Result<Reply> {
        loop {
            let reply = self.reader.read_reply();
            let reply = self.io(reply)?;
            if !reply.is_preliminary() {
                return Ok(reply);
            }
        }
    }

    /// Send a command and return the server's final reply to it.
    fn command(&mut self, command: &str) -> Result<Reply> {
        self.check_usable()?;
        let sent = self.writer.write_command(command);
        self.io(sent)?;
        self.final_reply()
    }

    /// Send a command expected to open a data transfer, and return the data
    /// connection once the server has said it's starting.
    fn open_data(&mut self, command: &str) -> Result<TcpStream> {
        let channel = self.prepare_data()?;
        self.check_usable()?;
        let sent = self.writer.write_command(command);
        self.io(sent)?;
        let reply = self.reader.read_reply();
        let reply = self.io(reply)?;
        if !reply.is_preliminary() {
            reply.expect(&[125, 150])?;
        }
        let data = match channel {
            DataChannel::Passive(stream) => stream,
            DataChannel::Active(listener) => self.accept(listener)?,
        };
        data.set_read_timeout(Some(self.timeout))?;
        Ok(data)
    }

    /// Read the reply that ends a data transfer.
    fn close_data(&mut self) -> Result<()> {
        self.final_reply()?.expect(&[226, 250])?;
        Ok(())
    }

    fn prepare_data(&mut self) -> Result<DataChannel> {
        if self.passive {
            let addr = match self.peer.ip() {
                IpAddr::V4(_) => {
                    let reply = self.command("PASV")?.expect(&[227])?;
                    let port = parse_pasv(&reply.text())
                        .ok_or_else(|| anyhow!("Can't parse PASV reply {:?}", reply.text()))?;
                    // The reported host is often a private address; the
                    // control connection's peer is what we can reach.
                    SocketAddr::new(self.peer.ip(), port)
                }
                IpAddr::V6(_) => {
                    let reply = self.command("EPSV")?.expect(&[229])?;
                    let port = parse_epsv(&reply.text())
                        .ok_or_else(|| anyhow!("Can't parse EPSV reply {:?}", reply.text()))?;
                    SocketAddr::new(self.peer.ip(), port)
                }
            };
            trace!("data connection to {}", addr);
            let stream = TcpStream::connect_timeout(&addr, self.timeout)
                .with_context(|| format!("Failed to open data connection to {}", addr))?;
            Ok(DataChannel::Passive(stream))
        } else {
            let local = self.writer.local_addr()?;
            let listener = TcpListener::bind(SocketAddr::new(local.ip(), 0))?;
            let addr = listener.local_addr()?;
            let command = match addr {
                SocketAddr::V4(v4) => {
                    let o = v4.ip().octets();
                    format!(
                        "PORT {},{},{},{},{},{}",
                        o[0],
                        o[1],
                        o[2],
                        o[3],
                        addr.port() >> 8,
                        addr.port() & 0xff
                    )
                }
                SocketAddr::V6(v6) => format!("EPRT |2|{}|{}|", v6.ip(), addr.port()),
            };
            self.command(&command)?.expect_positive()?;
            Ok(DataChannel::Active(listener))
        }
    }

    /// Wait for the server to connect back in active mode.
    fn accept(&mut self, listener: TcpListener) -> Result<TcpStream> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match listener.accept() {
                Ok((stream, from)) => {
                    trace!("data connection from {}", from);
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        self.broken = true;
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "server didn't open the data connection",
                        )
                        .into());
                    }
                    sleep(ACCEPT_POLL);
                }
                Err(err) => return self.io(Err(err)),
            }
        }
    }

    /// Run a listing command and return its lines.
    fn list(&mut self, command: &str) -> Result<Vec<String>> {
        let mut data = BufReader::new(self.open_data(command)?);
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = data.read_until(b'\n', &mut buf);
            if self.io(read)? == 0 {
                break;
            }
            while buf.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
                buf.pop();
            }
            if !buf.is_empty() {
                lines.push(String::from_utf8_lossy(&buf).into_owned());
            }
        }
        drop(data);
        self.close_data()?;
        Ok(lines)
    }
}

impl Session for FtpStream {
    fn noop(&mut self) -> Result<()> {
        self.command("NOOP")?.expect_positive()?;
        Ok(())
    }

    fn binary_mode(&mut self) -> Result<()> {
        self.command("TYPE I")?.expect_positive()?;
        Ok(())
    }

    fn pwd(&mut self) -> Result<String> {
        let reply = self.command("PWD")?.expect(&[257])?;
        parse_pwd(&reply.text()).ok_or_else(|| anyhow!("Can't parse PWD reply {:?}", reply.text()))
    }

    fn cwd(&mut self, path: &str) -> Result<()> {
        self.command(&format!("CWD {}", path))?.expect_positive()?;
        Ok(())
    }

    fn mlsd(&mut self) -> Result<Vec<String>> {
        self.list("MLSD")
    }

    fn nlst(&mut self) -> Result<Vec<String>> {
        self.list("NLST")
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        let reply = self.command(&format!("SIZE {}", path))?.expect(&[213])?;
        let text = reply.text();
        text.trim()
            .parse()
            .with_context(|| format!("Can't parse SIZE reply {:?}", text))
    }

    fn feat(&mut self) -> Result<Vec<String>> {
        let reply = self.command("FEAT")?.expect(&[211])?;
        let n = reply.lines.len();
        Ok(if n > 2 {
            reply.lines[1..n - 1].to_vec()
        } else {
            Vec::new()
        })
    }

    fn quote(&mut self, command: &str) -> Result<String> {
        Ok(self.command(command)?.expect_positive()?.text())
    }

    fn retrieve(
        &mut self,
        path: &str,
        offset: u64,
        block_size: usize,
        out: &mut dyn Write,
    ) -> Result<u64> {
        if offset > 0 {
            self.command(&format!("REST {}", offset))?.expect(&[350])?;
        }
        let mut data = self.open_data(&format!("RETR {}", path))?;
        let mut buf = vec![0; block_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return self.io(Err(err)),
            };
            if let Err(err) = out.write_all(&buf[..n]) {
                // The server is still sending; the control channel will
                // have a stray reply.
                self.broken = true;
                let _ = data.shutdown(Shutdown::Both);
                return Err(err.into());
            }
            total += n as u64;
        }
        drop(data);
        self.close_data()?;
        trace!("received {} bytes of {:?} from offset {}", total, path, offset);
        Ok(total)
    }

    fn quit(&mut self) -> Result<()> {
        self.command("QUIT")?.expect_positive()?;
        Ok(())
    }
}

/// Connects and logs in to one server.
pub struct FtpConnector {
    address: Address,
    options: Options,
}

impl FtpConnector {
    pub fn new(address: Address, options: Options) -> FtpConnector {
        FtpConnector { address, options }
    }
}

impl Connector for FtpConnector {
    fn connect(&mut self) -> Result<Box<dyn Session>> {
        let mut ftp = FtpStream::connect(&self.address, &self.options)?;
        ftp.login(self.address.user(), self.address.password())?;
        if let Err(err) = ftp.binary_mode() {
            debug!("TYPE I failed: {:#}", err);
        }
        Ok(Box::new(ftp))
    }

    fn describe(&self) -> String {
        self.address.host_port()
    }
}

/// Open a TCP connection with keepalive enabled, so idle NAT mappings
/// survive long listings.
fn connect_socket(target: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let domain = if target.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if let Err(err) = socket.set_keepalive(true) {
        debug!("couldn't enable TCP keepalive: {}", err);
    }
    socket.connect_timeout(&SockAddr::from(target), timeout)?;
    Ok(socket.into())
}

/// Port from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv(text: &str) -> Option<u16> {
    lazy_static! {
        static ref PASV_RE: Regex =
            Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    }
    let caps = PASV_RE.captures(text)?;
    let p1: u8 = caps.get(5)?.as_str().parse().ok()?;
    let p2: u8 = caps.get(6)?.as_str().parse().ok()?;
    Some(u16::from(p1) << 8 | u16::from(p2))
}

/// Port from `229 Entering Extended Passive Mode (|||6446|)`, where `|` may
/// be any delimiter.
fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')? + 1;
    let end = text.rfind(')')?;
    let inner = text.get(start..end)?;
    let delim = inner.chars().next()?;
    inner.split(delim).nth(3)?.parse().ok()
}

/// Directory from `257 "/pub/my ""quoted"" dir" is current directory`.
fn parse_pwd(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let mut path = String::new();
    let mut chars = text[start..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
            } else {
                return Some(path);
            }
        }
        path.push(c);
    }
    None
}
