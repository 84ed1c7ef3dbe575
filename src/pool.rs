use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};

use crate::error::RotationError;
use crate::identity::{NetworkIdentity, Subnet};

/// Candidate and held identities drawn from one subnet.
///
/// `available` and `assigned` never overlap, and every address appears at
/// most once across both sets. Regeneration swaps both sets out wholesale.
pub struct IdentityPool {
    subnet: Subnet,
    ports: RangeInclusive<u16>,
    target_size: usize,
    available: HashSet<NetworkIdentity>,
    assigned: HashSet<NetworkIdentity>,
    generation: u64,
    rng: StdRng,
}

impl IdentityPool {
    pub fn new(subnet: Subnet, ports: RangeInclusive<u16>, target_size: usize) -> Self {
        Self::with_rng(subnet, ports, target_size, StdRng::from_entropy())
    }

    pub fn with_rng(
        subnet: Subnet,
        ports: RangeInclusive<u16>,
        target_size: usize,
        rng: StdRng,
    ) -> Self {
        let ports = if ports.start() <= ports.end() {
            ports
        } else {
            *ports.end()..=*ports.start()
        };
        let mut pool = Self {
            subnet,
            ports,
            target_size,
            available: HashSet::new(),
            assigned: HashSet::new(),
            generation: 0,
            rng,
        };
        pool.generate(subnet, target_size);
        pool
    }

    /// Draws `count` random hosts from `subnet`, each paired with a random
    /// port. Repeated addresses collapse to their first draw, so small
    /// subnets yield fewer than `count` identities.
    fn draw_candidates(&mut self, subnet: Subnet, count: usize) -> HashSet<NetworkIdentity> {
        let hosts = subnet.host_count();
        let ports = self.ports.clone();
        let rng = &mut self.rng;
        let mut by_address: HashMap<Ipv4Addr, u16> = HashMap::new();
        for _ in 0..count {
            let index = rng.gen_range(0..hosts);
            if let Some(address) = subnet.host(index) {
                by_address
                    .entry(address)
                    .or_insert_with(|| rng.gen_range(ports.clone()));
            }
        }
        by_address
            .into_iter()
            .map(|(address, port)| NetworkIdentity::new(address, port))
            .collect()
    }

    fn install(&mut self, candidates: HashSet<NetworkIdentity>) -> usize {
        self.available = candidates;
        self.assigned.clear();
        self.generation += 1;
        log::info!(
            "generated identity pool #{} with {} identities from {}",
            self.generation,
            self.available.len(),
            self.subnet
        );
        self.available.len()
    }

    /// Replaces the pool with `count` fresh candidates from `subnet`. All
    /// assignment bookkeeping is dropped; holders must be reassigned by the
    /// caller in the same critical section.
    pub(crate) fn generate(&mut self, subnet: Subnet, count: usize) -> usize {
        self.subnet = subnet;
        self.target_size = count;
        let candidates = self.draw_candidates(subnet, count);
        self.install(candidates)
    }

    /// Rebuilds from the configured subnet, but only if the fresh set can
    /// serve `holders` identities. On failure the pool is left as it was.
    pub fn regenerate(&mut self, holders: usize) -> Result<usize, RotationError> {
        let candidates = self.draw_candidates(self.subnet, self.target_size);
        if candidates.len() < holders {
            log::warn!(
                "discarding pool rebuild: {} candidates for {} holders",
                candidates.len(),
                holders
            );
            return Err(RotationError::PoolExhausted {
                requested: holders,
                capacity: candidates.len(),
            });
        }
        Ok(self.install(candidates))
    }

    pub fn acquire(&mut self) -> Result<NetworkIdentity, RotationError> {
        self.acquire_excluding(None)
    }

    /// Like [`acquire`](Self::acquire), but never hands back `current`.
    pub fn acquire_replacing(
        &mut self,
        current: NetworkIdentity,
    ) -> Result<NetworkIdentity, RotationError> {
        self.acquire_excluding(Some(current))
    }

    fn acquire_excluding(
        &mut self,
        exclude: Option<NetworkIdentity>,
    ) -> Result<NetworkIdentity, RotationError> {
        let has_candidate = self.available.iter().any(|id| Some(*id) != exclude);
        if !has_candidate {
            let holders = self.assigned.len() + 1;
            self.regenerate(holders)?;
        }
        self.take_excluding(exclude)
            .ok_or(RotationError::PoolExhausted { requested: 1, capacity: 0 })
    }

    /// Moves a random free identity to `assigned` without ever rebuilding.
    pub fn take(&mut self) -> Option<NetworkIdentity> {
        self.take_excluding(None)
    }

    fn take_excluding(&mut self, exclude: Option<NetworkIdentity>) -> Option<NetworkIdentity> {
        let chosen = self
            .available
            .iter()
            .filter(|id| Some(**id) != exclude)
            .choose(&mut self.rng)
            .copied()?;
        self.available.remove(&chosen);
        self.assigned.insert(chosen);
        Some(chosen)
    }

    /// Returns a held identity to the free set. Unknown identities are ignored.
    pub fn release(&mut self, identity: NetworkIdentity) {
        if self.assigned.remove(&identity) {
            self.available.insert(identity);
        }
    }

    pub fn free_count(&self) -> usize {
        self.available.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }

    pub fn total_count(&self) -> usize {
        self.available.len() + self.assigned.len()
    }

    pub fn is_assigned(&self, identity: &NetworkIdentity) -> bool {
        self.assigned.contains(identity)
    }

    pub fn is_available(&self, identity: &NetworkIdentity) -> bool {
        self.available.contains(identity)
    }

    /// Bumped on every wholesale rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    #[cfg(test)]
    pub(crate) fn set_target_size(&mut self, target_size: usize) {
        self.target_size = target_size;
    }

    #[cfg(test)]
    pub(crate) fn drain_available(&mut self) {
        self.available.clear();
    }

    #[cfg(test)]
    pub(crate) fn assigned_set(&self) -> HashSet<NetworkIdentity> {
        self.assigned.clone()
    }

    #[cfg(test)]
    pub(crate) fn available_set(&self) -> HashSet<NetworkIdentity> {
        self.available.clone()
    }
}
