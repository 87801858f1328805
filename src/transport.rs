use futures_util::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

// Any bidirectional byte stream a backend can talk over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens the byte stream for a backend.
///
/// The engine calls [`Connector::open`] once per connection attempt and owns
/// the returned transport until it disconnects.
pub trait Connector: Send + Sync + 'static {
    fn open<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedTransport>>;
}

// Plain TCP, the transport real devices speak
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}
