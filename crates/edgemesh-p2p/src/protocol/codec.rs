//! Length-framed protobuf codec for the libp2p `request_response` protocols.
//!
//! Wire format per message:
//!   [4 bytes big-endian length][proto3-encoded payload]

use std::{io, marker::PhantomData};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use prost::Message;

/// Control-plane messages are tiny; anything larger than this is corrupt.
const MAX_MSG_BYTES: usize = 1024 * 1024;

async fn write_framed<W, T>(io: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Message,
{
    let payload = msg.encode_to_vec();
    if payload.len() > MAX_MSG_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    let len = payload.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.close().await
}

async fn read_framed<R, T>(io: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: Message + Default,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MSG_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "incoming message too large"));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    T::decode(payload.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// `request_response::Codec` exchanging one protobuf request/response pair.
pub struct ProstCodec<Req, Resp> {
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> Default for ProstCodec<Req, Resp> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<Req, Resp> Clone for ProstCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

#[async_trait]
impl<Req, Resp> request_response::Codec for ProstCodec<Req, Resp>
where
    Req: Message + Default + Send,
    Resp: Message + Default + Send,
{
    type Protocol = StreamProtocol;
    type Request = Req;
    type Response = Resp;

    async fn read_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Req>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn read_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Resp>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn write_request<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        req: Req,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        resp: Resp,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp).await
    }
}
