//! Communicators
//!
//! The consistency protocol only needs two collectives: a blocking exchange
//! of one packet per partner over a named interface, and a global sum. Every
//! participant packs and sends all its packets before it receives any.

use crate::error::{MgError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};

/// Payload sent to one partner in one exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    /// Component values, a fixed number per packed item
    pub values: Vec<f64>,
    /// Skip masks, one per packed item
    pub masks: Vec<u64>,
    /// Item flags (participation, ownership), one per packed item
    pub flags: Vec<u8>,
    /// Global id keys for variable-length payloads
    pub keys: Vec<u64>,
}

/// Collective communication layer of one processor.
pub trait Communicator: Send + Sync {
    /// Rank of this processor
    fn rank(&self) -> usize;

    /// Number of processors
    fn size(&self) -> usize;

    /// Send one packet to each partner and receive one from each.
    ///
    /// Returns the incoming packets in the order of `outgoing`.
    fn exchange(
        &self,
        interface: &str,
        outgoing: Vec<(usize, Packet)>,
    ) -> Result<Vec<(usize, Packet)>>;

    /// Sum `values` element-wise over all processors
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;
}

/// Single processor: no partners, reductions are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(
        &self,
        interface: &str,
        outgoing: Vec<(usize, Packet)>,
    ) -> Result<Vec<(usize, Packet)>> {
        match outgoing.first() {
            None => Ok(Vec::new()),
            Some((partner, _)) => Err(MgError::exchange(
                interface,
                format!("serial communicator has no partner {}", partner),
            )),
        }
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Message {
    tag: String,
    packet: Packet,
}

/// In-process ranks joined by unbounded channels, one per ordered pair.
///
/// Each rank is meant to run on its own thread.
#[derive(Debug)]
pub struct ChannelCommunicator {
    rank: usize,
    senders: Vec<Sender<Message>>,
    receivers: Vec<Receiver<Message>>,
}

impl ChannelCommunicator {
    /// Communicators for `size` ranks, indexed by rank
    pub fn create(size: usize) -> Vec<ChannelCommunicator> {
        let mut senders: Vec<Vec<Sender<Message>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Message>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        // channel (from, to) sits at senders[from][to] and receivers[to][from]
        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }
        // receivers[to] was filled in `from` order
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ChannelCommunicator {
                rank,
                senders,
                receivers,
            })
            .collect()
    }

    fn send(&self, interface: &str, to: usize, packet: Packet) -> Result<()> {
        let tx = self
            .senders
            .get(to)
            .ok_or_else(|| MgError::exchange(interface, format!("no rank {}", to)))?;
        tx.send(Message {
            tag: interface.to_string(),
            packet,
        })
        .map_err(|_| MgError::exchange(interface, format!("rank {} disconnected", to)))
    }

    fn recv(&self, interface: &str, from: usize) -> Result<Packet> {
        let rx = self
            .receivers
            .get(from)
            .ok_or_else(|| MgError::exchange(interface, format!("no rank {}", from)))?;
        let message = rx
            .recv()
            .map_err(|_| MgError::exchange(interface, format!("rank {} disconnected", from)))?;
        if message.tag != interface {
            return Err(MgError::exchange(
                interface,
                format!("rank {} sent a packet for {}", from, message.tag),
            ));
        }
        Ok(message.packet)
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn exchange(
        &self,
        interface: &str,
        outgoing: Vec<(usize, Packet)>,
    ) -> Result<Vec<(usize, Packet)>> {
        let partners: Vec<usize> = outgoing.iter().map(|(p, _)| *p).collect();
        for (partner, packet) in outgoing {
            self.send(interface, partner, packet)?;
        }
        partners
            .into_iter()
            .map(|partner| Ok((partner, self.recv(interface, partner)?)))
            .collect()
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        const TAG: &str = "all_reduce_sum";
        for to in (0..self.size()).filter(|&r| r != self.rank) {
            self.send(
                TAG,
                to,
                Packet {
                    values: values.to_vec(),
                    ..Default::default()
                },
            )?;
        }
        // sum in rank order so every rank gets bitwise the same result
        let mut total = vec![0.0; values.len()];
        for from in 0..self.size() {
            let contribution = if from == self.rank {
                values.to_vec()
            } else {
                self.recv(TAG, from)?.values
            };
            if contribution.len() != values.len() {
                return Err(MgError::exchange(
                    TAG,
                    format!(
                        "rank {} sent {} values, expected {}",
                        from,
                        contribution.len(),
                        values.len()
                    ),
                ));
            }
            for (t, c) in total.iter_mut().zip(contribution) {
                *t += c;
            }
        }
        values.copy_from_slice(&total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_serial_exchange_without_partners() {
        let comm = SerialCommunicator;
        assert!(comm.exchange("border", Vec::new()).unwrap().is_empty());
        assert!(comm.exchange("border", vec![(1, Packet::default())]).is_err());
    }

    #[test]
    fn test_channel_exchange_and_reduce() {
        let handles: Vec<_> = ChannelCommunicator::create(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let outgoing = (0..3)
                        .filter(|&p| p != rank)
                        .map(|p| {
                            (
                                p,
                                Packet {
                                    values: vec![rank as f64],
                                    ..Default::default()
                                },
                            )
                        })
                        .collect();
                    let incoming = comm.exchange("test", outgoing).unwrap();
                    for (partner, packet) in &incoming {
                        assert_eq!(packet.values, vec![*partner as f64]);
                    }
                    let mut v = [rank as f64, 1.0];
                    comm.all_reduce_sum(&mut v).unwrap();
                    v
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), [3.0, 3.0]);
        }
    }

    #[test]
    fn test_disconnected_partner_is_exchange_error() {
        let mut comms = ChannelCommunicator::create(2);
        let second = comms.pop().unwrap();
        drop(comms);
        let err = second.exchange("border", vec![(0, Packet::default())]).unwrap_err();
        assert!(matches!(err, MgError::Exchange { .. }));
    }
}
