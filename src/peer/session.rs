use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinSet};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Instrument;
use crate::{
    archive::ArchiveError,
    clearing::ClearingHouse,
    data::{FilePieceSpecSet, Filter, Piece, PieceSpecSet},
    net::Connection,
};
use super::{
    Notice, NoticeCodec, NoticeQueue, PeerError, PieceCodec, Request, RequestCodec, RequestQueue,
    Result,
};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes delivered by the remote since the counter was last restarted.
/// The client manager ranks peers by this.
#[derive(Debug, Default)]
pub struct PeerCounter {
    bytes: AtomicU64,
    counting: AtomicBool,
}

impl PeerCounter {
    pub fn new() -> Self {
        PeerCounter {
            bytes: AtomicU64::new(0),
            counting: AtomicBool::new(true),
        }
    }

    pub fn add(&self, n: u64) {
        if self.counting.load(Ordering::Relaxed) {
            self.bytes.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.counting.store(false, Ordering::Relaxed);
    }

    /// Zeroes the counter so the next ranking covers only the coming
    /// period.
    pub fn restart(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.counting.store(true, Ordering::Relaxed);
    }
}

/// The clearing house's view of a live session: enough to route
/// notifications to it, rank it and cancel it, without owning it.
pub struct PeerHandle {
    pub id: u64,
    pub remote_server: SocketAddr,
    pub local_filter: Filter,
    pub remote_filter: Filter,
    pub counter: Arc<PeerCounter>,
    notices: Arc<NoticeQueue>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn notify_addition(&self, set: FilePieceSpecSet) {
        self.notices.push_addition(set);
    }

    pub fn notify_removals(&self, ids: impl IntoIterator<Item = crate::data::FileId>) {
        self.notices.push_removals(ids);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// One full-duplex session with a remote node. Runs one task per
/// stream direction plus a scanner that announces the local archive.
pub struct Peer {
    pub remote_server: SocketAddr,

    // What this node wants from the remote.
    pub local_filter: Filter,

    // What the remote wants from this node.
    pub remote_filter: Filter,

    pub clearing: Arc<ClearingHouse>,

    pub counter: Arc<PeerCounter>,

    pub cancel: CancellationToken,
}

enum Exit {
    // All locally desired data has been received.
    Done,

    // The task has no more work; the session stays up.
    Finished,
}

impl Peer {
    /// Runs the session to completion. Returns `true` only if this was
    /// a valid (non-duplicate) session and every locally desired piece
    /// has been received; any stream error surfaces as `Err`.
    #[tracing::instrument(name = "peer", skip(self, connection), fields(remote = %self.remote_server))]
    pub async fn run(self, connection: Connection) -> Result<bool> {
        let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
        let notices = Arc::new(NoticeQueue::new());
        let requests = Arc::new(RequestQueue::new());

        let handle = Arc::new(PeerHandle {
            id,
            remote_server: self.remote_server,
            local_filter: self.local_filter.clone(),
            remote_filter: self.remote_filter.clone(),
            counter: self.counter.clone(),
            notices: notices.clone(),
            cancel: self.cancel.clone(),
        });
        if !self.clearing.add(handle) {
            tracing::debug!("duplicate session, yielding to the existing one");
            return Ok(false);
        }

        let result = self.drive(id, connection, notices, requests).await;
        self.clearing.remove(id);
        match &result {
            Ok(done) => tracing::debug!("session over, done: {}", done),
            Err(e) => tracing::debug!("session error: {}", e),
        }
        result
    }

    async fn drive(
        &self,
        id: u64,
        connection: Connection,
        notices: Arc<NoticeQueue>,
        requests: Arc<RequestQueue>,
    ) -> Result<bool> {
        let Connection {
            notice,
            request,
            data,
        } = connection;
        let (notice_sink, notice_stream) = notice.split();
        let (request_sink, request_stream) = request.split();
        let (data_sink, data_stream) = data.split();

        if self.local_filter.is_nothing() && self.remote_filter.is_nothing() {
            // Neither side wants anything; nothing to do.
            return Ok(false);
        }

        // Rendezvous between the request receiver and the piece
        // sender: at most one piece in flight per session.
        let (piece_tx, piece_rx) = mpsc::channel::<Piece>(1);

        let mut tasks: JoinSet<Result<Exit>> = JoinSet::new();
        let span = tracing::Span::current();

        // Outbound half: only if the remote wants anything at all.
        if !self.remote_filter.is_nothing() {
            tasks.spawn(
                notice_sender(self.cancel.clone(), notices.clone(), notice_sink)
                    .instrument(span.clone()),
            );
            tasks.spawn(
                request_receiver(
                    self.cancel.clone(),
                    request_stream,
                    self.remote_filter.clone(),
                    self.clearing.clone(),
                    piece_tx,
                )
                .instrument(span.clone()),
            );
            tasks.spawn(
                piece_sender(self.cancel.clone(), piece_rx, data_sink).instrument(span.clone()),
            );
            tasks.spawn(
                file_scanner(self.remote_filter.clone(), self.clearing.clone(), notices)
                    .instrument(span.clone()),
            );
        }

        // Inbound half. The receivers always run so the remote's
        // streams stay drained; they act on the traffic only when this
        // node wants data.
        let requesting = !self.local_filter.is_nothing();
        tasks.spawn(
            notice_receiver(
                self.cancel.clone(),
                notice_stream,
                self.clearing.clone(),
                requests.clone(),
                id,
                requesting,
            )
            .instrument(span.clone()),
        );
        tasks.spawn(
            piece_receiver(
                self.cancel.clone(),
                data_stream,
                self.clearing.clone(),
                self.counter.clone(),
                id,
                requesting,
            )
            .instrument(span.clone()),
        );
        if requesting {
            tasks.spawn(
                request_sender(self.cancel.clone(), requests, request_sink)
                    .instrument(span.clone()),
            );
        }

        let mut done = false;
        let mut failure: Option<PeerError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Exit::Done)) => {
                    done = true;
                    self.cancel.cancel();
                }
                Ok(Ok(Exit::Finished)) => {}
                Ok(Err(e)) => {
                    if failure.is_none() && !done {
                        failure = Some(e);
                    }
                    self.cancel.cancel();
                }
                Err(join) if join.is_cancelled() => {}
                Err(join) => {
                    failure.get_or_insert(PeerError::Task(join.to_string()));
                    self.cancel.cancel();
                }
            }
        }

        match failure {
            Some(e) if !done => Err(e),
            _ => Ok(done),
        }
    }
}

async fn notice_sender(
    cancel: CancellationToken,
    queue: Arc<NoticeQueue>,
    mut sink: SplitSink<Framed<TcpStream, NoticeCodec>, Notice>,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            notice = queue.take() => {
                tracing::trace!("send: {}", notice);
                sink.send(notice).await?;
            }
        }
    }
}

async fn notice_receiver(
    cancel: CancellationToken,
    mut stream: SplitStream<Framed<TcpStream, NoticeCodec>>,
    clearing: Arc<ClearingHouse>,
    requests: Arc<RequestQueue>,
    peer_id: u64,
    requesting: bool,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            next = stream.next() => {
                let notice = read_frame(next)?;
                tracing::trace!("read: {}", notice);
                if !requesting {
                    continue;
                }
                match notice {
                    Notice::Addition(set) => {
                        let mut wanted = PieceSpecSet::new();
                        for spec in set.iter_specs() {
                            if clearing.process_notice(peer_id, &spec) {
                                wanted.merge_spec(spec);
                            }
                        }
                        requests.merge(wanted);
                    }
                    Notice::RemovedFile(id) => clearing.process_removal(peer_id, vec![id])?,
                    Notice::RemovedFiles(ids) => clearing.process_removal(peer_id, ids)?,
                }
            }
        }
    }
}

async fn request_sender(
    cancel: CancellationToken,
    queue: Arc<RequestQueue>,
    mut sink: SplitSink<Framed<TcpStream, RequestCodec>, Request>,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            set = queue.take() => {
                let request = Request(set);
                tracing::trace!("send: {}", request);
                sink.send(request).await?;
            }
        }
    }
}

async fn request_receiver(
    cancel: CancellationToken,
    mut stream: SplitStream<Framed<TcpStream, RequestCodec>>,
    remote_filter: Filter,
    clearing: Arc<ClearingHouse>,
    piece_tx: mpsc::Sender<Piece>,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            next = stream.next() => {
                let Request(set) = read_frame(next)?;
                tracing::trace!("read: request for {}", set);
                for spec in set.iter_specs() {
                    if !remote_filter.matches(&spec.info.id.path) {
                        tracing::warn!("request outside remote filter: {}", spec);
                        continue;
                    }
                    match clearing.get_piece(&spec)? {
                        Some(piece) => {
                            if piece_tx.send(piece).await.is_err() {
                                return Ok(Exit::Finished);
                            }
                        }
                        // Never fabricate a piece the archive lacks.
                        None => tracing::debug!("requested piece not held: {}", spec),
                    }
                }
            }
        }
    }
}

async fn piece_sender(
    cancel: CancellationToken,
    mut piece_rx: mpsc::Receiver<Piece>,
    mut sink: SplitSink<Framed<TcpStream, PieceCodec>, Piece>,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            piece = piece_rx.recv() => match piece {
                Some(piece) => {
                    tracing::trace!("send: {}", piece);
                    sink.send(piece).await?;
                }
                None => return Ok(Exit::Finished),
            }
        }
    }
}

async fn piece_receiver(
    cancel: CancellationToken,
    mut stream: SplitStream<Framed<TcpStream, PieceCodec>>,
    clearing: Arc<ClearingHouse>,
    counter: Arc<PeerCounter>,
    peer_id: u64,
    requesting: bool,
) -> Result<Exit> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Finished),
            next = stream.next() => {
                let piece = read_frame(next)?;
                tracing::trace!("read: {}", piece);
                if !requesting {
                    tracing::debug!("dropping unsolicited {}", piece);
                    continue;
                }
                let len = piece.data.len() as u64;
                match clearing.process_piece(peer_id, &piece) {
                    Ok((used, done)) => {
                        if used {
                            counter.add(len);
                        }
                        if done {
                            tracing::debug!("all desired data received");
                            return Ok(Exit::Done);
                        }
                    }
                    // Mismatched file information: skip the piece, keep
                    // the session.
                    Err(e @ (ArchiveError::InvalidPiece(_) | ArchiveError::InfoMismatch(_))) => {
                        tracing::warn!("dropping piece {}: {}", piece, e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

// Walks the local archive once and announces everything the remote's
// filter covers.
async fn file_scanner(
    remote_filter: Filter,
    clearing: Arc<ClearingHouse>,
    notices: Arc<NoticeQueue>,
) -> Result<Exit> {
    let outcome = tokio::task::spawn_blocking(move || {
        clearing.walk(&remote_filter, |set| notices.push_addition(set))
    })
    .await;
    match outcome {
        Ok(Ok(())) => Ok(Exit::Finished),
        Ok(Err(e)) => Err(e.into()),
        Err(join) => Err(PeerError::Task(join.to_string())),
    }
}

fn read_frame<T>(next: Option<std::result::Result<T, PeerError>>) -> Result<T> {
    match next {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e),
        None => Err(PeerError::Io(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        ))),
    }
}
