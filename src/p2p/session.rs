use std::sync::Arc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::Instrument;
use crate::torrent::TorrentContext;
use super::{message::MessageCodec, reader, writer, PeerId};

pub use super::peer::ConnInfo as PeerConnInfo;

// A live connection's tasks. The torrent owns the peer state; this handle
// owns the tasks moving bytes for it.
#[derive(Debug)]
pub struct PeerHandle {

    pub id: PeerId,

    reader_handle: Option<JoinHandle<()>>,

    writer_handle: Option<JoinHandle<()>>,

}

pub struct PeerSession;

impl PeerSession {

    // Attaches a handshaken transport to the torrent: registers the peer,
    // splits the stream through the wire codec, and spawns the read and
    // write halves. The handshake itself happened upstream; `conn` carries
    // what it learned.
    pub fn spawn<S>(ctx: Arc<TorrentContext>, conn: PeerConnInfo, stream: S) -> PeerHandle
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let addr = conn.remote_addr;
        let id = ctx.insert_peer(conn);

        let codec = MessageCodec::new(Arc::clone(&ctx.block_pool), ctx.config.max_frame_len);
        let (sink, stream) = Framed::new(stream, codec).split();

        let reader_ctx = Arc::clone(&ctx);
        let reader_handle = tokio::spawn(
            async move {
                match reader::run(Arc::clone(&reader_ctx), id, stream).await {
                    Ok(()) => tracing::debug!("reader finished"),
                    Err(e) => tracing::warn!("reader failed: {}", e),
                }
                // Whatever ended the read half ends the connection.
                reader_ctx.close_peer(id);
            }
            .instrument(tracing::info_span!("peer", %id, %addr)),
        );

        let writer_ctx = Arc::clone(&ctx);
        let writer_handle = tokio::spawn(
            async move {
                match writer::run(Arc::clone(&writer_ctx), id, sink).await {
                    Ok(()) => tracing::debug!("writer finished"),
                    Err(e) => tracing::warn!("writer failed: {}", e),
                }
                writer_ctx.close_peer(id);
            }
            .instrument(tracing::info_span!("peer", %id, %addr)),
        );

        PeerHandle {
            id,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }
}

impl PeerHandle {

    // Closes the connection and waits for both halves to unwind, then
    // drops the peer from the torrent's arena.
    pub async fn shutdown(&mut self, ctx: &TorrentContext) {
        ctx.close_peer(self.id);
        if let Some(handle) = self.reader_handle.take() {
            handle.await.ok();
        }
        if let Some(handle) = self.writer_handle.take() {
            handle.await.ok();
        }
        ctx.remove_peer(self.id);
    }
}
