//! Communicator hierarchy and proxy election.
//!
//! Runs once per solver instance at initialization and feeds every other
//! component with the communicator set and this process's role. The
//! hierarchy mirrors the physical layout: global world, node-local world,
//! the world of device-owning processes, and one world per device that
//! groups a proxy with the relay processes feeding it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::comm::Communicator;
use crate::error::{FunnelError, Result};

/// Per-process role in the gather-solve-scatter protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Elected owner of an accelerator device; performs the actual solve
    /// on behalf of its device world.
    Proxy { device: usize },
    /// Owns no device; its rows and vectors are funnelled through the
    /// proxy of `device` on the same node.
    Relay { device: usize },
}

impl Role {
    pub fn is_proxy(&self) -> bool {
        matches!(self, Role::Proxy { .. })
    }

    /// The node-local device this process solves on (proxy) or feeds
    /// (relay).
    pub fn device(&self) -> usize {
        match *self {
            Role::Proxy { device } | Role::Relay { device } => device,
        }
    }
}

/// Immutable per-process topology record, valid until finalize.
#[derive(Debug, Clone)]
pub struct ProcessTopology {
    pub global_rank: usize,
    pub global_size: usize,
    pub node_rank: usize,
    pub node_size: usize,
    pub role: Role,
    /// Rank among device-owning processes; `None` on relays.
    pub owners_rank: Option<usize>,
    pub owners_size: usize,
    /// Rank within this process's device world. The proxy is always 0.
    pub device_rank: usize,
    pub device_size: usize,
}

/// The nested communicator handles. Field order is destruction order:
/// Rust drops fields in declaration order, so the most specific group is
/// torn down first and the global duplicate last.
#[derive(Debug)]
pub struct CommunicatorSet<C: Communicator> {
    /// One proxy plus the relays that feed it.
    pub device: C,
    /// Device-owning processes only; `None` on relays.
    pub owners: Option<C>,
    /// All processes on this physical node.
    pub node: C,
    /// Duplicate of the caller's communicator; isolates the bridge's
    /// collectives from caller traffic.
    pub global: C,
}

/// Map arbitrary keys to dense color values in first-occurrence order.
fn dense_colors(keys: &[u64]) -> Vec<u32> {
    let mut seen: Vec<u64> = Vec::new();
    keys.iter()
        .map(|k| match seen.iter().position(|s| s == k) {
            Some(i) => i as u32,
            None => {
                seen.push(*k);
                (seen.len() - 1) as u32
            }
        })
        .collect()
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Build the communicator hierarchy and elect one proxy per device.
///
/// `device_count` is the number of accelerator devices on this node (from
/// `device::visible_device_count` or the engine's own inventory). Node
/// ranks below the device count own a device outright; every other rank
/// on the node relays through device `node_rank % device_count`, which
/// spreads relays evenly and binds distinct devices before wrapping.
///
/// Collective over `comm`: every member must call this with its own node
/// identity and device count.
pub fn build<C: Communicator>(
    comm: &C,
    device_count: usize,
) -> Result<(CommunicatorSet<C>, ProcessTopology)> {
    let global = comm.duplicate()?;
    let global_rank = global.rank();
    let global_size = global.size();

    // Device counts are agreed on collectively before any further split:
    // a node with no device must fail every rank, not just its own, or
    // the survivors deadlock in the splits below.
    let device_counts = global.allgather_u64(device_count as u64)?;
    if device_count == 0 {
        return Err(FunnelError::Environment(format!(
            "no accelerator device visible on node '{}' (rank {global_rank})",
            comm.node_name()
        )));
    }
    if let Some(bad) = device_counts.iter().position(|&c| c == 0) {
        return Err(FunnelError::Environment(format!(
            "rank {bad} reports no accelerator device on its node"
        )));
    }

    // Node-local world: split by hashed node identity. Hashes are mapped
    // to dense colors so collisions across different names would merge
    // worlds rather than crash; names on one node always agree.
    let node_keys = global.allgather_u64(hash_name(&comm.node_name()))?;
    let node_colors = dense_colors(&node_keys);
    let node = global
        .split(Some(node_colors[global_rank]), global_rank)?
        .ok_or_else(|| FunnelError::Topology("node split produced no group".into()))?;
    let node_rank = node.rank();
    let node_size = node.size();

    let owning = node_rank < device_count;
    let device_id = node_rank % device_count;
    let role = if owning {
        Role::Proxy { device: device_id }
    } else {
        Role::Relay { device: device_id }
    };

    // World of device-owning processes.
    let owners = global.split(if owning { Some(0) } else { None }, global_rank)?;
    let owners_rank = owners.as_ref().map(|c| c.rank());
    let owners_size = owners.as_ref().map(|c| c.size()).unwrap_or(0);

    // Per-device world: color by the (node, device) pair, densely
    // renumbered so colors are unique across nodes. The owner keys to 0
    // and therefore always lands at device-world rank 0.
    let pair = ((node_colors[global_rank] as u64) << 32) | device_id as u64;
    let pair_colors = dense_colors(&global.allgather_u64(pair)?);
    let key = if owning { 0 } else { node_rank + 1 };
    let device = global
        .split(Some(pair_colors[global_rank]), key)?
        .ok_or_else(|| FunnelError::Topology("device split produced no group".into()))?;
    let device_rank = device.rank();
    let device_size = device.size();

    // Cross-check the election: exactly one owner per device world, and
    // it must sit at rank 0 so gathers and scatters can root there.
    let owner_flags = device.allgather_u64(owning as u64)?;
    let owners_in_group: u64 = owner_flags.iter().sum();
    if owners_in_group != 1 || owner_flags[0] != 1 {
        return Err(FunnelError::Topology(format!(
            "device world for node {} device {device_id} elected {owners_in_group} proxies",
            node_colors[global_rank]
        )));
    }

    let topology = ProcessTopology {
        global_rank,
        global_size,
        node_rank,
        node_size,
        role,
        owners_rank,
        owners_size,
        device_rank,
        device_size,
    };

    tracing::debug!(
        global_rank,
        node_rank,
        device_rank,
        device = device_id,
        proxy = role.is_proxy(),
        "topology built"
    );

    Ok((
        CommunicatorSet {
            device,
            owners,
            node,
            global,
        },
        topology,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalCluster;
    use std::sync::Arc;
    use std::thread;

    fn build_all(
        nodes: &[(&str, usize)],
        device_count: usize,
    ) -> Vec<ProcessTopology> {
        let endpoints = LocalCluster::with_nodes(nodes);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let (_set, topo) = build(&comm, device_count).expect("build failed");
                    topo
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn dense_colors_follow_first_occurrence() {
        assert_eq!(dense_colors(&[9, 9, 4, 9, 4, 1]), vec![0, 0, 1, 0, 1, 2]);
        assert_eq!(dense_colors(&[]), Vec::<u32>::new());
    }

    #[test]
    fn single_rank_single_device_is_its_own_proxy() {
        let topos = build_all(&[("n0", 1)], 1);
        let t = &topos[0];
        assert_eq!(t.role, Role::Proxy { device: 0 });
        assert_eq!(t.device_size, 1);
        assert_eq!(t.owners_rank, Some(0));
        assert_eq!(t.owners_size, 1);
    }

    #[test]
    fn four_ranks_two_devices_pairs_one_relay_per_proxy() {
        let topos = build_all(&[("n0", 4)], 2);
        // Node ranks 0,1 own devices 0,1; ranks 2,3 relay via modulo.
        assert_eq!(topos[0].role, Role::Proxy { device: 0 });
        assert_eq!(topos[1].role, Role::Proxy { device: 1 });
        assert_eq!(topos[2].role, Role::Relay { device: 0 });
        assert_eq!(topos[3].role, Role::Relay { device: 1 });
        for t in &topos {
            assert_eq!(t.device_size, 2);
        }
        assert_eq!(topos[0].owners_size, 2);
        assert_eq!(topos[1].owners_size, 2);
        assert_eq!(topos[2].owners_rank, None);
        // Proxies sit at device-world rank 0.
        assert_eq!(topos[0].device_rank, 0);
        assert_eq!(topos[2].device_rank, 1);
    }

    #[test]
    fn relays_wrap_around_devices_when_unevenly_divisible() {
        let topos = build_all(&[("n0", 5)], 2);
        let relay_devices: Vec<usize> = topos[2..].iter().map(|t| t.role.device()).collect();
        // Node ranks 2,3,4 -> devices 0,1,0.
        assert_eq!(relay_devices, vec![0, 1, 0]);
        assert_eq!(topos[2].device_size, 3); // proxy 0 + relays 2 and 4
        assert_eq!(topos[3].device_size, 2);
    }

    #[test]
    fn two_nodes_split_locally() {
        let topos = build_all(&[("n0", 2), ("n1", 2)], 1);
        for t in &topos {
            assert_eq!(t.node_size, 2);
            assert_eq!(t.device_size, 2);
        }
        assert!(topos[0].role.is_proxy());
        assert!(!topos[1].role.is_proxy());
        assert!(topos[2].role.is_proxy());
        assert!(!topos[3].role.is_proxy());
        assert_eq!(topos[0].owners_size, 2);
    }

    #[test]
    fn zero_devices_is_fatal() {
        let comm = LocalCluster::new(1).pop().unwrap();
        let err = build(&comm, 0).unwrap_err();
        assert!(matches!(err, FunnelError::Environment(_)));
    }

    #[test]
    fn deviceless_node_fails_every_rank() {
        // Only n1 lacks devices; n0's ranks must fail too instead of
        // waiting forever in the later splits.
        let endpoints = LocalCluster::with_nodes(&[("n0", 2), ("n1", 2)]);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let devices = if comm.node_name() == "n0" { 1 } else { 0 };
                    build(&comm, devices).err()
                })
            })
            .collect();
        for h in handles {
            let err = h.join().unwrap().expect("build should fail on every rank");
            assert!(matches!(err, FunnelError::Environment(_)));
        }
    }

    #[test]
    fn every_rank_lands_in_exactly_one_device_world_with_one_proxy() {
        // Property sweep over process and device counts on one node.
        for devices in 1..=3usize {
            for ranks in devices..=devices + 4 {
                let endpoints = LocalCluster::with_nodes(&[("n0", ranks)]);
                let handles: Vec<_> = endpoints
                    .into_iter()
                    .map(|comm| {
                        thread::spawn(move || {
                            let (set, topo) = build(&comm, devices).expect("build failed");
                            // One proxy per world, observed from inside it.
                            let flags = set
                                .device
                                .allgather_u64(topo.role.is_proxy() as u64)
                                .unwrap();
                            (topo, flags.iter().sum::<u64>())
                        })
                    })
                    .collect();
                let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
                let world_sizes: usize = results
                    .iter()
                    .filter(|(t, _)| t.role.is_proxy())
                    .map(|(t, _)| t.device_size)
                    .sum();
                assert_eq!(world_sizes, ranks, "P={ranks} D={devices}");
                for (t, proxies) in &results {
                    assert_eq!(*proxies, 1, "P={ranks} D={devices} rank={}", t.global_rank);
                }
            }
        }
    }

    #[test]
    fn topology_is_shareable_across_components() {
        // Role/topology records travel by value alongside the set.
        let topos = build_all(&[("n0", 2)], 1);
        let shared = Arc::new(topos);
        assert_eq!(shared[0].global_size, 2);
    }
}
