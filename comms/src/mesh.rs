use std::{borrow::Cow, net::SocketAddr, time::Duration};

use log::{debug, info, warn};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{self, Instant},
};

use crate::{
    FrameReceiver, FrameSender, MeshErr, PartyRole, Result, Transport,
    msg::{Command, Msg, Payload},
};

const DUPLEX_BUF_SIZE: usize = 1 << 20;
const ABORT_SEND_BOUND: Duration = Duration::from_millis(500);
const GOODBYE_SEND_BOUND: Duration = Duration::from_millis(500);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Upper bounds for every blocking wait of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a role waits at the batch barrier.
    pub barrier: Duration,
    /// How long a role waits for a single share.
    pub exchange: Duration,
    /// How long the mesh setup waits for its peers to come up.
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            barrier: Duration::from_secs(60),
            exchange: Duration::from_secs(300),
            connect: Duration::from_secs(30),
        }
    }
}

struct Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
}

/// A fully connected link set between the three parties.
///
/// `Role0` hosts the barrier: it collects an `Arrive` from each peer and answers with a
/// `Release`. Any failure poisons the mesh and broadcasts an `Abort`, so a crashed or
/// stuck role brings every other role down within the configured bounds.
pub struct Mesh<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    role: PartyRole,
    links: [Option<Link<R, W>>; PartyRole::COUNT],
    timeouts: Timeouts,
    poisoned: bool,
}

/// A mesh over TCP connections, one per pair of roles.
pub type TcpMesh = Mesh<OwnedReadHalf, OwnedWriteHalf>;

/// A mesh over in-process duplex pipes, used to run the three roles in one process.
pub type InMemoryMesh = Mesh<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

impl<R, W> Mesh<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a new `Mesh` without any links.
    ///
    /// # Arguments
    /// * `role` - The role of this process.
    /// * `timeouts` - The bounds for the blocking waits.
    ///
    /// # Returns
    /// A new `Mesh` instance.
    pub fn new(role: PartyRole, timeouts: Timeouts) -> Self {
        Self {
            role,
            links: [None, None, None],
            timeouts,
            poisoned: false,
        }
    }

    /// Registers the channel to `peer`, replacing any previous one.
    ///
    /// # Arguments
    /// * `peer` - The role at the other end of the channel.
    /// * `rx` - The receiving end.
    /// * `tx` - The sending end.
    pub fn attach(&mut self, peer: PartyRole, rx: FrameReceiver<R>, tx: FrameSender<W>) {
        debug!(role = self.role.id(), peer = peer.id(); "link attached");
        self.links[peer.id()] = Some(Link { rx, tx });
    }

    /// Whether every peer has a link.
    pub fn is_complete(&self) -> bool {
        self.role.peers().all(|peer| self.links[peer.id()].is_some())
    }

    /// Whether an earlier failure stopped this mesh.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    fn link(&mut self, peer: PartyRole) -> Result<&mut Link<R, W>> {
        if self.poisoned {
            return Err(MeshErr::Poisoned);
        }

        self.links[peer.id()]
            .as_mut()
            .ok_or(MeshErr::NotConnected(peer))
    }

    async fn send_to(&mut self, peer: PartyRole, msg: &Msg<'_>) -> Result<()> {
        let link = self.link(peer)?;
        link.tx.send(msg).await?;
        Ok(())
    }

    async fn recv_until(
        &mut self,
        peer: PartyRole,
        deadline: Instant,
        waited: Duration,
    ) -> Result<Msg<'static>> {
        let link = self.link(peer)?;

        match time::timeout_at(deadline, link.rx.recv::<Msg<'static>>()).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(MeshErr::PeerLeft(peer)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MeshErr::Timeout { peer, waited }),
        }
    }

    async fn recv_within(&mut self, peer: PartyRole, bound: Duration) -> Result<Msg<'static>> {
        self.recv_until(peer, Instant::now() + bound, bound).await
    }

    /// Poisons the mesh and tells every reachable peer to stop.
    ///
    /// # Arguments
    /// * `err` - The failure that stopped this role.
    ///
    /// # Returns
    /// The same error, for propagation.
    async fn fail(&mut self, err: MeshErr) -> MeshErr {
        if self.poisoned {
            return err;
        }

        self.poisoned = true;
        warn!(role = self.role.id(); "mesh failure, aborting peers: {err}");

        let msg = Msg::Control(Command::Abort {
            reason: format!("{} failed: {err}", self.role),
        });

        for peer in self.role.peers() {
            if let Some(link) = self.links[peer.id()].as_mut() {
                if let Err(e) = link.tx.send_within(&msg, ABORT_SEND_BOUND).await {
                    debug!(role = self.role.id(); "abort to {peer} not delivered: {e}");
                }
            }
        }

        err
    }

    /// Barrier side of the master: every peer must arrive before the shared deadline.
    async fn gather(&mut self, epoch: usize, batch: usize) -> Result<()> {
        let bound = self.timeouts.barrier;
        let deadline = Instant::now() + bound;

        for peer in self.role.peers() {
            match self.recv_until(peer, deadline, bound).await? {
                Msg::Control(Command::Arrive { epoch: e, batch: b }) if (e, b) == (epoch, batch) => {
                    debug!(peer = peer.id(), epoch = epoch, batch = batch; "peer arrived");
                }
                Msg::Control(Command::Arrive { epoch: e, batch: b }) => {
                    return Err(MeshErr::BarrierMismatch {
                        peer,
                        expected: (epoch, batch),
                        got: (e, b),
                    });
                }
                other => return Err(unexpected(peer, "control/arrive", other)),
            }
        }

        let release = Msg::Control(Command::Release { epoch, batch });
        for peer in self.role.peers() {
            self.send_to(peer, &release).await?;
        }

        Ok(())
    }

    /// Barrier side of a follower: announce the arrival, then wait for the release.
    async fn await_release(&mut self, epoch: usize, batch: usize) -> Result<()> {
        let master = PartyRole::master();
        let arrive = Msg::Control(Command::Arrive { epoch, batch });
        self.send_to(master, &arrive).await?;

        match self.recv_within(master, self.timeouts.barrier).await? {
            Msg::Control(Command::Release { epoch: e, batch: b }) if (e, b) == (epoch, batch) => {
                Ok(())
            }
            Msg::Control(Command::Release { epoch: e, batch: b }) => Err(MeshErr::BarrierMismatch {
                peer: master,
                expected: (epoch, batch),
                got: (e, b),
            }),
            other => Err(unexpected(master, "control/release", other)),
        }
    }
}

impl<R, W> Transport for Mesh<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn role(&self) -> PartyRole {
        self.role
    }

    async fn send_share(&mut self, to: PartyRole, layer: u32, values: &[f32]) -> Result<()> {
        let msg = Msg::Data(Payload {
            layer,
            values: Cow::Borrowed(values),
        });

        match self.send_to(to, &msg).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn recv_share(&mut self, from: PartyRole, layer: u32) -> Result<Vec<f32>> {
        let bound = self.timeouts.exchange;
        let result = match self.recv_within(from, bound).await {
            Ok(Msg::Data(Payload { layer: got, values })) if got == layer => Ok(values.into_owned()),
            Ok(Msg::Data(Payload { layer: got, .. })) => Err(MeshErr::LayerMismatch {
                peer: from,
                expected: layer,
                got,
            }),
            Ok(other) => Err(unexpected(from, "data/share", other)),
            Err(e) => Err(e),
        };

        match result {
            Ok(values) => Ok(values),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn barrier(&mut self, epoch: usize, batch: usize) -> Result<()> {
        let result = if self.role.is_master() {
            self.gather(epoch, batch).await
        } else {
            self.await_release(epoch, batch).await
        };

        match result {
            Ok(()) => {
                debug!(role = self.role.id(), epoch = epoch, batch = batch; "barrier released");
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let links = std::mem::replace(&mut self.links, [None, None, None]);

        if !self.poisoned {
            let msg = Msg::Control(Command::Disconnect);
            for (peer, link) in PartyRole::ALL.into_iter().zip(links) {
                let Some(mut link) = link else { continue };

                match link.tx.send_within(&msg, GOODBYE_SEND_BOUND).await {
                    Ok(()) => {}
                    Err(e) if peer_gone(&e) => {
                        debug!(role = self.role.id(), peer = peer.id(); "peer already gone: {e}");
                    }
                    Err(e) => {
                        warn!(role = self.role.id(), peer = peer.id(); "goodbye not delivered: {e}");
                    }
                }
            }
        }

        info!(role = self.role.id(); "mesh closed");
        Ok(())
    }
}

impl InMemoryMesh {
    /// Creates the three ends of an in-process mesh.
    ///
    /// # Arguments
    /// * `timeouts` - The bounds for the blocking waits, shared by every role.
    ///
    /// # Returns
    /// One mesh per role, indexed by role id.
    pub fn in_memory(timeouts: Timeouts) -> [InMemoryMesh; PartyRole::COUNT] {
        let mut meshes = PartyRole::ALL.map(|role| Mesh::new(role, timeouts));

        for (a, b) in [
            (PartyRole::Role0, PartyRole::Role1),
            (PartyRole::Role0, PartyRole::Role2),
            (PartyRole::Role1, PartyRole::Role2),
        ] {
            let (stream_a, stream_b) = io::duplex(DUPLEX_BUF_SIZE);

            let (rx, tx) = io::split(stream_a);
            let (rx, tx) = crate::channel(rx, tx);
            meshes[a.id()].attach(b, rx, tx);

            let (rx, tx) = io::split(stream_b);
            let (rx, tx) = crate::channel(rx, tx);
            meshes[b.id()].attach(a, rx, tx);
        }

        meshes
    }
}

impl TcpMesh {
    /// Connects this role to its two peers.
    ///
    /// Every role listens on its own address. A role dials the roles with a lower id and
    /// accepts the roles with a higher id; the dialing side announces itself with a
    /// `Hello`.
    ///
    /// # Arguments
    /// * `role` - The role of this process.
    /// * `addrs` - The listening address of every role, indexed by role id.
    /// * `timeouts` - The bounds for the blocking waits.
    ///
    /// # Returns
    /// A complete mesh or an error if some peer did not come up in time.
    pub async fn connect(
        role: PartyRole,
        addrs: &[SocketAddr; PartyRole::COUNT],
        timeouts: Timeouts,
    ) -> Result<TcpMesh> {
        let listener = TcpListener::bind(addrs[role.id()]).await?;
        Self::connect_on(role, listener, addrs, timeouts).await
    }

    /// Like `connect`, accepting the higher roles on an already bound `listener`.
    ///
    /// # Arguments
    /// * `role` - The role of this process.
    /// * `listener` - The listener peers with a higher id dial into.
    /// * `addrs` - The listening address of every role, indexed by role id.
    /// * `timeouts` - The bounds for the blocking waits.
    ///
    /// # Returns
    /// A complete mesh or an error if some peer did not come up in time.
    pub async fn connect_on(
        role: PartyRole,
        listener: TcpListener,
        addrs: &[SocketAddr; PartyRole::COUNT],
        timeouts: Timeouts,
    ) -> Result<TcpMesh> {
        info!(role = role.id(); "listening at {}", listener.local_addr()?);

        let mut mesh = Mesh::new(role, timeouts);
        let deadline = Instant::now() + timeouts.connect;

        for peer in role.peers().filter(|&peer| peer < role) {
            let stream = dial(peer, addrs[peer.id()], deadline, timeouts.connect).await?;
            stream.set_nodelay(true)?;

            let (rx, tx) = stream.into_split();
            let (rx, mut tx) = crate::channel(rx, tx);
            tx.send(&Msg::Control(Command::Hello { role })).await?;
            mesh.attach(peer, rx, tx);
            info!(role = role.id(), peer = peer.id(); "connected to peer");
        }

        while let Some(missing) = mesh.first_missing() {
            let (stream, addr) = match time::timeout_at(deadline, listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => {
                    return Err(MeshErr::Timeout {
                        peer: missing,
                        waited: timeouts.connect,
                    });
                }
            };

            stream.set_nodelay(true)?;
            let (rx, tx) = stream.into_split();
            let (mut rx, tx) = crate::channel(rx, tx);

            let hello = time::timeout_at(deadline, rx.recv::<Msg<'static>>()).await;
            match hello {
                Ok(Ok(Msg::Control(Command::Hello { role: peer })))
                    if peer > role && mesh.links[peer.id()].is_none() =>
                {
                    mesh.attach(peer, rx, tx);
                    info!(role = role.id(), peer = peer.id(); "accepted peer from {addr}");
                }
                Ok(Ok(msg)) => warn!("rejecting connection from {addr}: got {}", msg.kind()),
                Ok(Err(e)) => warn!("rejecting connection from {addr}: {e}"),
                Err(_) => warn!("rejecting connection from {addr}: no hello in time"),
            }
        }

        Ok(mesh)
    }

    fn first_missing(&self) -> Option<PartyRole> {
        self.role
            .peers()
            .find(|peer| self.links[peer.id()].is_none())
    }
}

async fn dial(
    peer: PartyRole,
    addr: SocketAddr,
    deadline: Instant,
    waited: Duration,
) -> Result<TcpStream> {
    loop {
        match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!(peer = peer.id(); "{addr} not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
            _ => return Err(MeshErr::Timeout { peer, waited }),
        }
    }
}

/// Whether a write failed only because the other end already closed its link.
fn peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Maps a message that does not fit the current step into the matching failure.
fn unexpected(peer: PartyRole, expected: &'static str, msg: Msg<'_>) -> MeshErr {
    match msg {
        Msg::Control(Command::Abort { reason }) | Msg::Err(reason) => {
            MeshErr::Aborted { by: peer, reason }
        }
        Msg::Control(Command::Disconnect) => MeshErr::PeerLeft(peer),
        other => MeshErr::UnexpectedMessage {
            peer,
            expected,
            got: other.kind(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short() -> Timeouts {
        Timeouts {
            barrier: Duration::from_millis(150),
            exchange: Duration::from_millis(150),
            connect: Duration::from_millis(150),
        }
    }

    #[tokio::test]
    async fn barrier_releases_when_every_role_arrives() {
        let [mut m0, mut m1, mut m2] = InMemoryMesh::in_memory(short());

        let (r0, r1, r2) = tokio::join!(m0.barrier(0, 0), m1.barrier(0, 0), m2.barrier(0, 0));
        assert!(r0.is_ok() && r1.is_ok() && r2.is_ok());

        let (r0, r1, r2) = tokio::join!(m0.barrier(0, 1), m1.barrier(0, 1), m2.barrier(0, 1));
        assert!(r0.is_ok() && r1.is_ok() && r2.is_ok());
    }

    #[tokio::test]
    async fn absent_role_fails_every_other_role() {
        let [mut m0, mut m1, _m2] = InMemoryMesh::in_memory(short());

        let (r0, r1) = tokio::join!(m0.barrier(0, 0), m1.barrier(0, 0));

        let e0 = r0.unwrap_err();
        let e1 = r1.unwrap_err();
        assert!(matches!(e0, MeshErr::Timeout { peer: PartyRole::Role2, .. }));
        assert!(e1.is_sync_failure(), "{e1}");

        assert!(m0.is_poisoned() && m1.is_poisoned());
        assert!(matches!(m0.barrier(0, 1).await, Err(MeshErr::Poisoned)));
    }

    #[tokio::test]
    async fn barrier_of_another_batch_is_a_mismatch() {
        let [mut m0, mut m1, mut m2] = InMemoryMesh::in_memory(short());

        let (r0, _, _) = tokio::join!(m0.barrier(0, 0), m1.barrier(0, 1), m2.barrier(0, 0));
        assert!(matches!(
            r0,
            Err(MeshErr::BarrierMismatch {
                peer: PartyRole::Role1,
                expected: (0, 0),
                got: (0, 1),
            })
        ));
    }

    #[tokio::test]
    async fn shares_are_tagged_with_their_layer() {
        let [mut m0, mut m1, _m2] = InMemoryMesh::in_memory(short());

        m0.send_share(PartyRole::Role1, 3, &[1.0, 2.0]).await.unwrap();
        assert_eq!(m1.recv_share(PartyRole::Role0, 3).await.unwrap(), vec![1.0, 2.0]);

        m0.send_share(PartyRole::Role1, 3, &[1.0]).await.unwrap();
        let err = m1.recv_share(PartyRole::Role0, 4).await.unwrap_err();
        assert!(matches!(
            err,
            MeshErr::LayerMismatch {
                expected: 4,
                got: 3,
                ..
            }
        ));
        assert!(m1.is_poisoned());
    }

    #[tokio::test]
    async fn dropped_peer_is_reported() {
        let [mut m0, m1, _m2] = InMemoryMesh::in_memory(short());
        drop(m1);

        let err = m0.recv_share(PartyRole::Role1, 0).await.unwrap_err();
        assert!(matches!(err, MeshErr::PeerLeft(PartyRole::Role1)));
    }

    #[tokio::test]
    async fn abort_reaches_the_waiting_peer() {
        let [mut m0, mut m1, _m2] = InMemoryMesh::in_memory(short());

        let _ = m0.recv_share(PartyRole::Role2, 0).await;
        assert!(m0.is_poisoned());

        let err = m1.recv_share(PartyRole::Role0, 0).await.unwrap_err();
        assert!(matches!(err, MeshErr::Aborted { by: PartyRole::Role0, .. }));
    }

    #[tokio::test]
    async fn shutdown_tolerates_peers_that_already_left() {
        let [mut m0, mut m1, mut m2] = InMemoryMesh::in_memory(short());

        m0.shutdown().await.unwrap();
        drop(m0);

        m1.shutdown().await.unwrap();
        m2.shutdown().await.unwrap();
        assert!(!m1.is_complete() && !m2.is_complete());
    }

    #[tokio::test]
    async fn shutdown_clears_links_even_when_poisoned() {
        let [mut m0, _m1, _m2] = InMemoryMesh::in_memory(short());

        let _ = m0.recv_share(PartyRole::Role1, 0).await;
        assert!(m0.is_poisoned());

        m0.shutdown().await.unwrap();
        assert!(!m0.is_complete());
    }

    #[tokio::test]
    async fn tcp_mesh_connects_three_roles() {
        let mut listeners = Vec::new();
        for _ in PartyRole::ALL {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: [SocketAddr; 3] = [
            listeners[0].local_addr().unwrap(),
            listeners[1].local_addr().unwrap(),
            listeners[2].local_addr().unwrap(),
        ];
        let timeouts = Timeouts {
            connect: Duration::from_secs(5),
            ..short()
        };

        let mut listeners = listeners.into_iter();
        let (l0, l1, l2) = (
            listeners.next().unwrap(),
            listeners.next().unwrap(),
            listeners.next().unwrap(),
        );
        let (m0, m1, m2) = tokio::join!(
            TcpMesh::connect_on(PartyRole::Role0, l0, &addrs, timeouts),
            TcpMesh::connect_on(PartyRole::Role1, l1, &addrs, timeouts),
            TcpMesh::connect_on(PartyRole::Role2, l2, &addrs, timeouts),
        );
        let (mut m0, mut m1, mut m2) = (m0.unwrap(), m1.unwrap(), m2.unwrap());
        assert!(m0.is_complete() && m1.is_complete() && m2.is_complete());

        let (r0, r1, r2) = tokio::join!(m0.barrier(0, 0), m1.barrier(0, 0), m2.barrier(0, 0));
        assert!(r0.is_ok() && r1.is_ok() && r2.is_ok());

        m2.send_share(PartyRole::Role1, 0, &[4.0]).await.unwrap();
        assert_eq!(m1.recv_share(PartyRole::Role2, 0).await.unwrap(), vec![4.0]);
    }
}
