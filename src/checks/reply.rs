use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::CheckError;

const MAX_REPLY_LINES: usize = 64;

/// A numeric reply as spoken by FTP and SMTP servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    /// First digit of the code: 2 completion, 3 intermediate, 4/5 failure.
    pub fn class(&self) -> u16 {
        self.code / 100
    }
}

/// Reads one reply, following `NNN-` continuation lines to the closing `NNN ` line.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, CheckError>
where
    R: AsyncBufRead + Unpin,
{
    let mut code = None;
    let mut text = Vec::new();
    let mut buf = Vec::new();

    for _ in 0..MAX_REPLY_LINES {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Err(CheckError::Protocol("Connection closed before reply".into()));
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);

        let parsed = line.get(..3).and_then(|c| c.parse::<u16>().ok());
        let sep = line.as_bytes().get(3).copied();
        let body = line.get(4..).unwrap_or("");

        match (code, parsed) {
            (None, Some(c)) => {
                code = Some(c);
                text.push(body.trim().to_string());
                if sep != Some(b'-') {
                    break;
                }
            }
            (None, None) => {
                return Err(CheckError::Protocol(format!("Malformed reply: {}", line)));
            }
            (Some(c), Some(p)) if p == c => {
                text.push(body.trim().to_string());
                if sep != Some(b'-') {
                    break;
                }
            }
            (Some(_), _) => text.push(line.trim().to_string()),
        }
    }

    match code {
        Some(code) => Ok(Reply { code, text: text.join(" ").trim().to_string() }),
        None => Err(CheckError::Protocol("Empty reply".into())),
    }
}

/// Line-oriented command channel.
pub struct ReplyStream<S> {
    inner: BufReader<S>,
}

impl<S> ReplyStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { inner: BufReader::new(stream) }
    }

    pub async fn read_reply(&mut self) -> Result<Reply, CheckError> {
        read_reply(&mut self.inner).await
    }

    pub async fn send(&mut self, line: &str) -> Result<(), CheckError> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn command(&mut self, line: &str) -> Result<Reply, CheckError> {
        self.send(line).await?;
        self.read_reply().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_line_reply() {
        let mut input: &[u8] = b"220 mail.example ESMTP Postfix\r\n";
        let reply = read_reply(&mut input).await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text, "mail.example ESMTP Postfix");
        assert_eq!(reply.class(), 2);
    }

    #[tokio::test]
    async fn multi_line_reply_is_joined() {
        let mut input: &[u8] = b"250-mail.example\r\n250-PIPELINING\r\n250 8BITMIME\r\n";
        let reply = read_reply(&mut input).await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.text, "mail.example PIPELINING 8BITMIME");
        assert!(input.is_empty());
    }

    #[tokio::test]
    async fn continuation_lines_without_code() {
        let mut input: &[u8] = b"220-Welcome\r\n  to the archive\r\n220 ready\r\n";
        let reply = read_reply(&mut input).await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text, "Welcome to the archive ready");
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let mut input: &[u8] = b"hello there\r\n";
        assert!(matches!(read_reply(&mut input).await, Err(CheckError::Protocol(_))));

        let mut empty: &[u8] = b"";
        assert!(read_reply(&mut empty).await.is_err());
    }
}
