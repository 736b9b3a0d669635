use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::{JsonRpcRequest, JsonRpcResponse};

/// Default node socket, `~/.f3/f3.sock`
pub fn default_socket_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".f3").join("f3.sock"))
}

pub struct SocketClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl SocketClient {
    pub async fn connect_to(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let stream = UnixStream::connect(path.into()).await?;
        let (r, w) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(r),
            writer: w,
        })
    }

    pub async fn call(&mut self, request: JsonRpcRequest) -> Result<JsonRpcResponse, std::io::Error> {
        let payload = serde_json::to_string(&request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes = self.reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "socket closed while waiting for response",
            ));
        }

        let response: JsonRpcResponse = serde_json::from_str(line.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(response)
    }
}
