use crate::{ClusterCoordinator, ClusterError};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_ATTEMPTS: usize = 100;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    Reduce = 1,
    Broadcast = 2,
    Barrier = 3,
}

impl Opcode {
    fn from_byte(byte: u8) -> Result<Self, ClusterError> {
        match byte {
            1 => Ok(Opcode::Reduce),
            2 => Ok(Opcode::Broadcast),
            3 => Ok(Opcode::Barrier),
            other => Err(ClusterError::Protocol {
                expected: "opcode 1..=3".into(),
                got: format!("{other}"),
            }),
        }
    }
}

/// Blocking TCP collective transport. Rank 0 serves reductions and
/// broadcasts for every peer; each collective is one request/response
/// round-trip, so no worker applies an update before all gradients for
/// that step have been combined.
///
/// Buffers cross the wire as little-endian f32; same-endian hosts are
/// assumed within one training group.
pub struct TcpCluster {
    rank: usize,
    world_size: usize,
    // rank 0: one stream per peer, indexed by rank-1; others: just the root
    peers: Vec<Mutex<TcpStream>>,
}

impl TcpCluster {
    /// Establish the group: rank 0 binds `addr` and waits for every peer,
    /// peers connect with bounded retry.
    pub fn establish(addr: &str, rank: usize, world_size: usize) -> Result<Self, ClusterError> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|source| ClusterError::Bind {
                addr: addr.to_string(),
                source,
            })?;
            Self::from_listener(listener, world_size)
        } else {
            Self::connect(addr, rank, world_size)
        }
    }

    /// Rank 0 side, from an already-bound listener.
    pub fn from_listener(listener: TcpListener, world_size: usize) -> Result<Self, ClusterError> {
        let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut connected = 0;
        while connected < world_size - 1 {
            let (mut stream, peer_addr) = listener.accept()?;
            stream.set_nodelay(true)?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            let peer_rank = u32::from_le_bytes(hello) as usize;
            if peer_rank == 0 || peer_rank >= world_size {
                return Err(ClusterError::Protocol {
                    expected: format!("peer rank in 1..{world_size}"),
                    got: format!("{peer_rank}"),
                });
            }
            debug!(%peer_addr, peer_rank, "peer joined training group");
            peers[peer_rank - 1] = Some(stream);
            connected += 1;
        }
        let peers: Vec<Mutex<TcpStream>> = peers
            .into_iter()
            .map(|p| p.map(Mutex::new))
            .collect::<Option<_>>()
            .ok_or(ClusterError::PeerCount {
                expected: world_size - 1,
                got: connected,
            })?;
        info!(world_size, "training group established, this worker is rank 0");
        Ok(Self {
            rank: 0,
            world_size,
            peers,
        })
    }

    /// Peer side: connect to rank 0 with bounded retry, then identify.
    pub fn connect(addr: &str, rank: usize, world_size: usize) -> Result<Self, ClusterError> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_all(&(rank as u32).to_le_bytes())?;
                    info!(rank, world_size, addr, "joined training group");
                    return Ok(Self {
                        rank,
                        world_size,
                        peers: vec![Mutex::new(stream)],
                    });
                }
                Err(source) => {
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        std::thread::sleep(CONNECT_BACKOFF);
                    }
                    last_err = Some(source);
                }
            }
        }
        Err(ClusterError::Connect {
            addr: addr.to_string(),
            source: last_err.expect("at least one attempt"),
        })
    }

    fn root_stream(&self) -> &Mutex<TcpStream> {
        &self.peers[0]
    }
}

fn write_frame(stream: &mut TcpStream, op: Opcode, values: &[f32]) -> Result<(), ClusterError> {
    stream.write_all(&[op as u8])?;
    stream.write_all(&(values.len() as u64).to_le_bytes())?;
    stream.write_all(bytemuck::cast_slice(values))?;
    stream.flush()?;
    Ok(())
}

fn read_frame(
    stream: &mut TcpStream,
    op: Opcode,
    expected_len: usize,
) -> Result<Vec<f32>, ClusterError> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header)?;
    let got_op = Opcode::from_byte(header[0])?;
    let len = u64::from_le_bytes(header[1..9].try_into().expect("8 bytes")) as usize;
    if got_op != op || len != expected_len {
        return Err(ClusterError::Protocol {
            expected: format!("{op:?} of {expected_len} values"),
            got: format!("{got_op:?} of {len} values"),
        });
    }
    let mut values = vec![0f32; len];
    stream.read_exact(bytemuck::cast_slice_mut(&mut values))?;
    Ok(values)
}

impl ClusterCoordinator for TcpCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), ClusterError> {
        if self.rank == 0 {
            for peer in &self.peers {
                let mut stream = peer.lock().expect("peer stream poisoned");
                let contribution = read_frame(&mut stream, Opcode::Reduce, values.len())?;
                for (acc, v) in values.iter_mut().zip(contribution) {
                    *acc += v;
                }
            }
            let scale = 1.0 / self.world_size as f32;
            for v in values.iter_mut() {
                *v *= scale;
            }
            for peer in &self.peers {
                let mut stream = peer.lock().expect("peer stream poisoned");
                write_frame(&mut stream, Opcode::Reduce, values)?;
            }
        } else {
            let mut stream = self.root_stream().lock().expect("root stream poisoned");
            write_frame(&mut stream, Opcode::Reduce, values)?;
            let reduced = read_frame(&mut stream, Opcode::Reduce, values.len())?;
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn broadcast(&self, values: &mut [f32]) -> Result<(), ClusterError> {
        if self.rank == 0 {
            for peer in &self.peers {
                let mut stream = peer.lock().expect("peer stream poisoned");
                write_frame(&mut stream, Opcode::Broadcast, values)?;
            }
        } else {
            let mut stream = self.root_stream().lock().expect("root stream poisoned");
            let received = read_frame(&mut stream, Opcode::Broadcast, values.len())?;
            values.copy_from_slice(&received);
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), ClusterError> {
        if self.rank == 0 {
            for peer in &self.peers {
                let mut stream = peer.lock().expect("peer stream poisoned");
                read_frame(&mut stream, Opcode::Barrier, 0)?;
            }
            for peer in &self.peers {
                let mut stream = peer.lock().expect("peer stream poisoned");
                write_frame(&mut stream, Opcode::Barrier, &[])?;
            }
        } else {
            let mut stream = self.root_stream().lock().expect("root stream poisoned");
            write_frame(&mut stream, Opcode::Barrier, &[])?;
            read_frame(&mut stream, Opcode::Barrier, 0)?;
        }
        Ok(())
    }
}
