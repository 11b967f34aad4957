//! A concrete, grace-windowed implementation of the `Core -> Route
//! reconciler` contract (spec.md §6, §9). The core only depends on
//! [`crate::dataplane::RouteReconciler`]; this module is the one piece of
//! "ambient" plumbing supplied so the crate is runnable end to end (see
//! SPEC_FULL.md §10 and DESIGN.md).

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use crate::dataplane::{RouteDesire, RouteKind, RouteReconciler};

/// An injectable time source, so the grace window can be tested without
/// sleeping (spec.md §9: "the time source must be injectable for testing").
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The real clock, backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for tests.
pub struct FakeClock {
    base: Instant,
    offset: std::cell::Cell<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: std::cell::Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

/// Performs the actual kernel route add/delete once the grace-window
/// reconciler has decided what to do. A real implementation programs
/// netlink; tests use an in-memory recorder.
pub trait RouteInstaller {
    fn add_route(&mut self, route: &RouteDesire) -> Result<(), String>;
    fn del_route(&mut self, route: &RouteDesire) -> Result<(), String>;
}

struct PendingDeletion {
    route: RouteDesire,
    deadline: Instant,
}

/// A [`RouteReconciler`] that diffs the desired set against what it believes
/// is live, and holds routes that disappeared from the desired set in a
/// pending-deletion map for `grace` before actually deleting them -- so a
/// route's momentary absence during a key re-shuffle (S3) doesn't cause a
/// real delete.
pub struct GraceWindowRouteTable<C, I> {
    clock: C,
    installer: I,
    grace: Duration,
    desired: HashMap<u32, HashMap<String, RouteDesire>>,
    live: HashMap<String, RouteDesire>,
    pending_deletion: HashMap<String, PendingDeletion>,
}

impl<C: Clock, I: RouteInstaller> GraceWindowRouteTable<C, I> {
    pub fn new(clock: C, installer: I, grace: Duration) -> Self {
        Self {
            clock,
            installer,
            grace,
            desired: HashMap::new(),
            live: HashMap::new(),
            pending_deletion: HashMap::new(),
        }
    }

    fn desired_keys(&self) -> HashSet<&str> {
        self.desired
            .values()
            .flat_map(|routes| routes.keys())
            .map(String::as_str)
            .collect()
    }

    /// The kind of each route this reconciler currently believes is live.
    /// Exposed for tests that assert on the Unicast/Throw split after a
    /// conflict resolves or re-resolves (spec.md S3).
    pub fn live_kinds(&self) -> HashMap<String, RouteKind> {
        self.live.iter().map(|(k, v)| (k.clone(), v.kind)).collect()
    }
}

impl<C: Clock, I: RouteInstaller> RouteReconciler for GraceWindowRouteTable<C, I> {
    fn set_routes(&mut self, table: u32, routes: Vec<RouteDesire>) {
        let by_key = routes.into_iter().map(|r| (r.key.clone(), r)).collect();
        self.desired.insert(table, by_key);
    }

    fn queue_resync(&mut self) {
        // Force every desired route to be re-diffed against live state on
        // the next apply by forgetting what we believe is already live.
        self.live.clear();
    }

    fn apply(&mut self) -> Result<(), String> {
        let now = self.clock.now();
        let desired_keys: HashSet<String> =
            self.desired_keys().into_iter().map(str::to_owned).collect();

        // A route that reappeared in the desired set cancels any pending
        // deletion for it.
        self.pending_deletion.retain(|k, _| !desired_keys.contains(k));

        let tables: Vec<(u32, HashMap<String, RouteDesire>)> = self
            .desired
            .iter()
            .map(|(t, r)| (*t, r.clone()))
            .collect();
        for (_, routes) in tables {
            for (key, desire) in routes {
                let needs_install = self.live.get(&key) != Some(&desire);
                if needs_install {
                    self.installer.add_route(&desire)?;
                    self.live.insert(key, desire);
                }
            }
        }

        let stale: Vec<String> = self
            .live
            .keys()
            .filter(|k| !desired_keys.contains(k.as_str()))
            .cloned()
            .collect();
        for key in stale {
            if !self.pending_deletion.contains_key(&key) {
                let route = self.live[&key].clone();
                self.pending_deletion.insert(
                    key,
                    PendingDeletion {
                        route,
                        deadline: now + self.grace,
                    },
                );
            }
        }

        let expired: Vec<String> = self
            .pending_deletion
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(pending) = self.pending_deletion.remove(&key) {
                self.installer.del_route(&pending.route)?;
                self.live.remove(&key);
            }
        }

        Ok(())
    }
}
