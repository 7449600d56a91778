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

//! Talk to a scripted FTP server on a loopback socket.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ftpmirror::{
    Address, ConnectionManager, Connector, FtpConnector, Mirror, Options, RetryPolicy, Session,
};

const PASSWORD: &str = "secret";

#[derive(Default)]
struct Shared {
    /// Absolute path to contents; directories are implied.
    files: BTreeMap<String, Vec<u8>>,
    /// Every command received, passwords included.
    commands: Vec<String>,
    /// Drop both connections once a RETR of the path has sent this many bytes.
    cut: Option<(String, u64)>,
}

/// A tiny FTP server, good enough for one client at a time.
#[derive(Clone)]
struct ScriptedServer {
    shared: Arc<Mutex<Shared>>,
    addr: SocketAddr,
}

impl ScriptedServer {
    fn start(files: &[(&str, Vec<u8>)]) -> ScriptedServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Shared {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.clone()))
                .collect(),
            ..Shared::default()
        };
        let server = ScriptedServer {
            shared: Arc::new(Mutex::new(shared)),
            addr,
        };
        let handle = server.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.unwrap();
                let handle = handle.clone();
                thread::spawn(move || {
                    let _ = handle.serve(stream);
                });
            }
        });
        server
    }

    fn address(&self) -> Address {
        let mut address = Address::new("127.0.0.1");
        address
            .set_port(self.addr.port())
            .set_user("mirror")
            .set_password(PASSWORD)
            .set_path("/pub");
        address
    }

    fn commands(&self) -> Vec<String> {
        self.shared.lock().unwrap().commands.clone()
    }

    fn cut_retrieval(&self, path: &str, at: u64) {
        self.shared.lock().unwrap().cut = Some((path.to_owned(), at));
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{}/", path)
        };
        self.shared
            .lock()
            .unwrap()
            .files
            .keys()
            .any(|f| f.starts_with(&prefix))
    }

    /// Children of `dir`: name, and size if a file.
    fn children(&self, dir: &str) -> Vec<(String, Option<usize>)> {
        let prefix = if dir == "/" {
            "/".to_owned()
        } else {
            format!("{}/", dir)
        };
        let shared = self.shared.lock().unwrap();
        let mut children: BTreeMap<String, Option<usize>> = BTreeMap::new();
        for (path, content) in &shared.files {
            if let Some(rest) = path.strip_prefix(&prefix) {
                match rest.find('/') {
                    Some(i) => children.insert(rest[..i].to_owned(), None),
                    None => children.insert(rest.to_owned(), Some(content.len())),
                };
            }
        }
        children.into_iter().collect()
    }

    fn serve(&self, stream: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut w = stream;
        send(&mut w, "220 scripted server ready")?;
        let mut cwd = "/".to_owned();
        let mut rest = 0u64;
        let mut passive: Option<TcpListener> = None;
        let mut active: Option<SocketAddr> = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_owned();
            self.shared.lock().unwrap().commands.push(line.clone());
            let (verb, arg) = match line.find(' ') {
                Some(i) => (line[..i].to_ascii_uppercase(), line[i + 1..].to_owned()),
                None => (line.to_ascii_uppercase(), String::new()),
            };
            let path = resolve(&cwd, &arg);
            match verb.as_str() {
                "USER" => send(&mut w, "331 password please")?,
                "PASS" if arg == PASSWORD => send(&mut w, "230 logged in")?,
                "PASS" => send(&mut w, "530 login incorrect")?,
                "TYPE" | "NOOP" => send(&mut w, "200 ok")?,
                "PWD" => send(&mut w, &format!("257 \"{}\" is current", cwd))?,
                "CWD" if self.is_dir(&path) => {
                    cwd = path;
                    send(&mut w, "250 ok")?
                }
                "CWD" => send(&mut w, "550 no such directory")?,
                "FEAT" => send(
                    &mut w,
                    "211-Features:\r\n MLST type*;size*;modify*;\r\n SIZE\r\n REST STREAM\r\n211 End",
                )?,
                "SIZE" => match self.shared.lock().unwrap().files.get(&path) {
                    Some(content) => send(&mut w, &format!("213 {}", content.len()))?,
                    None => send(&mut w, "550 no such file")?,
                },
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0")?;
                    let port = listener.local_addr()?.port();
                    passive = Some(listener);
                    // A bogus host, as from a server behind NAT.
                    send(
                        &mut w,
                        &format!(
                            "227 Entering Passive Mode (10,9,8,7,{},{})",
                            port >> 8,
                            port & 0xff
                        ),
                    )?
                }
                "PORT" => {
                    let n: Vec<u16> = arg.split(',').map(|x| x.parse().unwrap()).collect();
                    active = Some(
                        format!("{}.{}.{}.{}:{}", n[0], n[1], n[2], n[3], n[4] << 8 | n[5])
                            .parse()
                            .unwrap(),
                    );
                    send(&mut w, "200 PORT ok")?
                }
                "REST" => {
                    rest = arg.parse().unwrap();
                    send(&mut w, "350 restarting")?
                }
                "RETR" => {
                    let (content, cut) = {
                        let mut shared = self.shared.lock().unwrap();
                        let content = shared.files.get(&path).cloned();
                        let cut = match shared.cut.take() {
                            Some((cut_path, at)) if cut_path == path => Some(at),
                            other => {
                                shared.cut = other;
                                None
                            }
                        };
                        (content, cut)
                    };
                    let content = match content {
                        Some(c) => c,
                        None => {
                            send(&mut w, "550 no such file")?;
                            continue;
                        }
                    };
                    send(&mut w, "150 opening data connection")?;
                    let mut data = open_data(&mut passive, &mut active)?;
                    let start = (rest as usize).min(content.len());
                    rest = 0;
                    match cut {
                        Some(at) => {
                            data.write_all(&content[start..at as usize])?;
                            // Drop both connections without a reply.
                            return Ok(());
                        }
                        None => data.write_all(&content[start..])?,
                    }
                    drop(data);
                    send(&mut w, "226 transfer complete")?
                }
                "MLSD" | "NLST" => {
                    send(&mut w, "150 here it comes")?;
                    let mut data = open_data(&mut passive, &mut active)?;
                    if verb == "MLSD" {
                        write!(data, "type=cdir;modify=20200101000000; {}\r\n", cwd)?;
                    }
                    for (name, size) in self.children(&cwd) {
                        if verb == "NLST" {
                            write!(data, "{}\r\n", name)?;
                        } else if let Some(size) = size {
                            write!(data, "type=file;size={};modify=20200102030405; {}\r\n", size, name)?;
                        } else {
                            write!(data, "type=dir;modify=20200101000000; {}\r\n", name)?;
                        }
                    }
                    drop(data);
                    send(&mut w, "226 done")?
                }
                "QUIT" => {
                    send(&mut w, "221 bye")?;
                    return Ok(());
                }
                _ => send(&mut w, "502 not implemented")?,
            }
        }
    }
}

fn send(w: &mut TcpStream, reply: &str) -> io::Result<()> {
    w.write_all(reply.as_bytes())?;
    w.write_all(b"\r\n")?;
    w.flush()
}

fn open_data(
    passive: &mut Option<TcpListener>,
    active: &mut Option<SocketAddr>,
) -> io::Result<TcpStream> {
    if let Some(listener) = passive.take() {
        Ok(listener.accept()?.0)
    } else if let Some(addr) = active.take() {
        TcpStream::connect(addr)
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "no data connection set up"))
    }
}

fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_owned()
    } else {
        format!("{}/{}", cwd, arg)
    };
    let parts: Vec<&str> = joined.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn options() -> Options {
    Options {
        timeout: Duration::from_secs(10),
        retry: RetryPolicy::immediate(3),
        block_size: 1000,
        ..Options::default()
    }
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn login_and_simple_commands() {
    let server = ScriptedServer::start(&[("/pub/a.bin", content(10))]);
    let mut connector = FtpConnector::new(server.address(), options());
    let mut session = connector.connect().unwrap();
    session.noop().unwrap();
    assert_eq!(session.pwd().unwrap(), "/");
    session.cwd("/pub").unwrap();
    assert_eq!(session.pwd().unwrap(), "/pub");
    assert_eq!(session.size("a.bin").unwrap(), 10);
    assert_eq!(
        session.feat().unwrap(),
        [" MLST type*;size*;modify*;", " SIZE", " REST STREAM"]
    );
    assert!(session.cwd("/nowhere").is_err());
    session.quit().unwrap();
    let commands = server.commands();
    assert_eq!(&commands[..3], ["USER mirror", "PASS secret", "TYPE I"]);
}

#[test]
fn wrong_password_is_refused() {
    let server = ScriptedServer::start(&[]);
    let mut address = server.address();
    address.set_password("guess");
    let mut connector = FtpConnector::new(address, options());
    let err = connector.connect().err().unwrap();
    let reply = err.downcast_ref::<ftpmirror::ReplyError>().unwrap();
    assert_eq!(reply.code, 530);
}

#[test]
fn passive_retrieve_with_restart() {
    let server = ScriptedServer::start(&[("/pub/a.bin", content(5000))]);
    let mut session = FtpConnector::new(server.address(), options())
        .connect()
        .unwrap();
    let mut out = Vec::new();
    assert_eq!(session.retrieve("/pub/a.bin", 0, 512, &mut out).unwrap(), 5000);
    assert_eq!(out, content(5000));
    let mut out = Vec::new();
    assert_eq!(session.retrieve("/pub/a.bin", 1200, 512, &mut out).unwrap(), 3800);
    assert_eq!(out, &content(5000)[1200..]);
    assert!(server.commands().contains(&"REST 1200".to_owned()));
    // The session is still in step afterwards.
    session.noop().unwrap();
}

#[test]
fn active_mode_listing() {
    let server = ScriptedServer::start(&[("/pub/a.bin", content(10)), ("/pub/d/b", content(3))]);
    let options = Options {
        passive: false,
        ..options()
    };
    let mut session = FtpConnector::new(server.address(), options).connect().unwrap();
    session.cwd("/pub").unwrap();
    assert_eq!(session.nlst().unwrap(), ["a.bin", "d"]);
    let mlsd = session.mlsd().unwrap();
    assert_eq!(mlsd.len(), 3);
    assert!(server.commands().iter().any(|c| c.starts_with("PORT 127,0,0,1,")));
}

#[test]
fn missing_file_is_a_permanent_reply() {
    let server = ScriptedServer::start(&[]);
    let mut session = FtpConnector::new(server.address(), options())
        .connect()
        .unwrap();
    let err = session
        .retrieve("/pub/none", 0, 512, &mut io::sink())
        .unwrap_err();
    assert_eq!(err.downcast_ref::<ftpmirror::ReplyError>().unwrap().code, 550);
    session.noop().unwrap();
}

#[test]
fn mirror_over_tcp_resumes_after_dropped_connection() {
    let server = ScriptedServer::start(&[
        ("/pub/big.bin", content(50_000)),
        ("/pub/sub/small.txt", b"hello\n".to_vec()),
    ]);
    server.cut_retrieval("/pub/big.bin", 20_000);
    let options = options();
    let address = server.address();
    let connector = FtpConnector::new(address.clone(), options.clone());
    let mut manager = ConnectionManager::open(Box::new(connector), &options).unwrap();
    let tmp = tempfile::Builder::new()
        .prefix("ftpmirror_tcp")
        .tempdir()
        .unwrap();
    let stats = Mirror::new(&options)
        .run(&mut manager, address.path(), tmp.path())
        .unwrap();
    manager.close();

    assert_eq!(stats.total_dirs, 2);
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.failed_files, 0);
    assert_eq!(stats.total_bytes, 50_006);
    assert_eq!(fs::read(tmp.path().join("big.bin")).unwrap(), content(50_000));
    assert_eq!(fs::read(tmp.path().join("sub/small.txt")).unwrap(), b"hello\n");
    assert!(server.commands().contains(&"REST 20000".to_owned()));
}
