// pixfetch-net/src/ftp.rs
//! Passive-mode FTP retrieval for `ftp://` URLs.
//!
//! One control connection per transfer: login (anonymous unless the URL
//! carries credentials), binary type, optional `SIZE`, `PASV`, `RETR`. The
//! data connection goes to the control peer's address, not the one the
//! server advertises.
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use pixfetch_common::ResponseMetadata;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};
use url::Url;

use crate::adapter::{ProgressCallback, TaskError, TaskResult};
use crate::data_url::percent_decode;

const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_PORT: u16 = 21;
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

struct Control {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl Control {
    async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TaskError> {
        let stream = connect((host, port), timeout).await?;
        let peer = stream.peer_addr().map_err(TaskError::transport)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
        })
    }

    async fn line(&mut self) -> Result<String, TaskError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(TaskError::transport)?;
        if n == 0 {
            return Err(TaskError::message("FTP server closed the control connection"));
        }
        Ok(line)
    }

    async fn reply(&mut self) -> Result<Reply, TaskError> {
        let first = self.line().await?;
        let code = parse_code(&first)?;
        let mut text = reply_text(&first);
        if first.as_bytes().get(3) == Some(&b'-') {
            // Multi-line reply, closed by "<code> ".
            let terminator = format!("{code} ");
            loop {
                let next = self.line().await?;
                if next.starts_with(&terminator) {
                    text = reply_text(&next);
                    break;
                }
            }
        }
        trace!("FTP <- {} {}", code, text);
        Ok(Reply { code, text })
    }

    async fn command(&mut self, command: &str) -> Result<Reply, TaskError> {
        if command.contains(&['\r', '\n'][..]) {
            return Err(TaskError::message("FTP command argument contains a line break"));
        }
        if command.starts_with("PASS ") {
            trace!("FTP -> PASS ****");
        } else {
            trace!("FTP -> {}", command);
        }
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(TaskError::transport)?;
        self.reply().await
    }

    async fn expect(&mut self, command: &str, accepted: &[u16]) -> Result<Reply, TaskError> {
        let reply = self.command(command).await?;
        check(command, reply, accepted)
    }
}

fn check(what: &str, reply: Reply, accepted: &[u16]) -> Result<Reply, TaskError> {
    if accepted.contains(&reply.code) {
        return Ok(reply);
    }
    let verb = what.split(' ').next().unwrap_or(what);
    Err(TaskError::message(format!(
        "FTP {verb} failed: {} {}",
        reply.code, reply.text
    )))
}

fn parse_code(line: &str) -> Result<u16, TaskError> {
    line.get(..3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TaskError::message(format!("Malformed FTP reply: {:?}", line.trim_end())))
}

fn reply_text(line: &str) -> String {
    line.get(4..).unwrap_or("").trim().to_string()
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_port(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = start + text[start..].find(')')?;
    let fields: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>().ok())
        .collect::<Option<_>>()?;
    if fields.len() != 6 || fields.iter().any(|f| *f > 255) {
        return None;
    }
    Some(fields[4] * 256 + fields[5])
}

fn decode(component: &str) -> String {
    String::from_utf8_lossy(&percent_decode(component)).into_owned()
}

async fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<TcpStream, TaskError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream.map_err(TaskError::transport),
        Err(elapsed) => Err(TaskError::transport(elapsed)),
    }
}

/// Downloads the file named by `url`, reporting every chunk.
pub(crate) async fn retrieve(
    url: &Url,
    connect_timeout: Duration,
    progress: &ProgressCallback,
) -> TaskResult {
    let host = url
        .host_str()
        .ok_or_else(|| TaskError::message(format!("FTP URL without host: {url}")))?;
    let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);
    let path = decode(url.path().trim_start_matches('/'));
    if path.is_empty() || path.ends_with('/') {
        return Err(TaskError::message(format!("FTP URL does not name a file: {url}")));
    }
    let user = match url.username() {
        "" => ANONYMOUS_USER.to_string(),
        name => decode(name),
    };
    let password = url
        .password()
        .map(decode)
        .unwrap_or_else(|| ANONYMOUS_PASSWORD.to_string());

    let mut control = Control::connect(host, port, connect_timeout).await?;
    let greeting = control.reply().await?;
    check("connect", greeting, &[220])?;

    let login = control.command(&format!("USER {user}")).await?;
    match login.code {
        230 => {}
        331 | 332 => {
            control.expect(&format!("PASS {password}"), &[202, 230]).await?;
        }
        _ => {
            check("USER", login, &[])?;
        }
    }
    control.expect("TYPE I", &[200]).await?;

    let size = match control.command(&format!("SIZE {path}")).await? {
        Reply { code: 213, text } => text.parse::<u64>().ok(),
        _ => None,
    };

    let passive = control.expect("PASV", &[227]).await?;
    let data_port = parse_pasv_port(&passive.text).ok_or_else(|| {
        TaskError::message(format!("Unreadable FTP passive reply: {}", passive.text))
    })?;
    let mut data = connect(SocketAddr::new(control.peer.ip(), data_port), connect_timeout).await?;
    control.expect(&format!("RETR {path}"), &[125, 150]).await?;

    let mut meta = ResponseMetadata::new(url.clone());
    meta.expected_content_length = size;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        let n = data.read(&mut buf).await.map_err(TaskError::transport)?;
        if n == 0 {
            break;
        }
        if received == 0 {
            meta.mime_type = infer::get(&buf[..n]).map(|kind| kind.mime_type().to_string());
        }
        received += n as u64;
        progress(Bytes::copy_from_slice(&buf[..n]), received, size);
    }
    drop(data);

    let done = control.reply().await?;
    check("RETR", done, &[226, 250])?;
    if let Err(e) = control.command("QUIT").await {
        trace!("FTP QUIT for {} failed: {}", url, e);
    }
    debug!("FTP transfer of {} finished: {} bytes", url, received);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_port_is_read_from_parentheses() {
        assert_eq!(
            parse_pasv_port("Entering Passive Mode (127,0,0,1,195,80)."),
            Some(195 * 256 + 80)
        );
        assert_eq!(parse_pasv_port("Entering Passive Mode"), None);
        assert_eq!(parse_pasv_port("(127,0,0,1,300,1)"), None);
        assert_eq!(parse_pasv_port("(127,0,0,1,20)"), None);
    }

    #[test]
    fn reply_lines_split_into_code_and_text() {
        assert_eq!(parse_code("226 Transfer complete\r\n").unwrap(), 226);
        assert_eq!(reply_text("226 Transfer complete\r\n"), "Transfer complete");
        assert_eq!(reply_text("220\r\n"), "");
        assert!(parse_code("hello\r\n").is_err());
    }

    #[test]
    fn unexpected_reply_names_the_command() {
        let reply = Reply {
            code: 550,
            text: "No such file".into(),
        };
        let err = check("RETR pics/a.png", reply, &[150]).unwrap_err();
        assert_eq!(err.to_string(), "FTP RETR failed: 550 No such file");
    }
}
